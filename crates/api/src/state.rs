//! Shared application state

use sqlx::PgPool;
use std::sync::Arc;

use clubkit_settlement::{ReferralSaga, SettlementCoordinator};

use crate::config::Config;

/// Application state shared across request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub coordinator: Arc<SettlementCoordinator>,
    pub referral: Arc<ReferralSaga>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        Self {
            coordinator: Arc::new(SettlementCoordinator::new(pool.clone())),
            referral: Arc::new(ReferralSaga::new(pool.clone())),
            config: Arc::new(config),
            pool,
        }
    }
}
