//! Clubkit background worker
//!
//! Runs the notification outbox drain and periodic maintenance sweeps.
//! Every job is safe to run on multiple worker instances at once: the
//! outbox drain locks rows with SKIP LOCKED and the sweeps are
//! conditional updates.

mod expiry;
mod outbox_processor;

use anyhow::Context;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long the outbox drain sleeps between passes
const OUTBOX_DRAIN_INTERVAL_SECS: u64 = 15;

/// How often maintenance sweeps run
const MAINTENANCE_INTERVAL_SECS: u64 = 300;

/// Retention for delivered/failed outbox rows
const OUTBOX_RETENTION_DAYS: i32 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let notify_url = std::env::var("NOTIFY_URL").ok();

    let pool = clubkit_shared::db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;

    let http_client = reqwest::Client::new();

    tracing::info!(
        notify_configured = notify_url.is_some(),
        "Clubkit worker started"
    );

    let mut drain_tick = tokio::time::interval(Duration::from_secs(OUTBOX_DRAIN_INTERVAL_SECS));
    let mut maintenance_tick =
        tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = drain_tick.tick() => {
                if let Some(url) = notify_url.as_deref() {
                    outbox_processor::process_outbox(&pool, &http_client, url).await;
                }
            }
            _ = maintenance_tick.tick() => {
                expiry::sweep_expired_subscriptions(&pool).await;
                expiry::sweep_stale_offers(&pool).await;
                outbox_processor::cleanup_old_notifications(&pool, OUTBOX_RETENTION_DAYS).await;
            }
        }
    }
}
