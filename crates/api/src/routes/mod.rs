//! API routes

pub mod health;
pub mod rewards;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/health/ready", get(health::readiness))
        .route("/webhooks/payment", post(webhooks::payment))
        .route("/rewards/:offer_id/choice", post(rewards::choose))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
