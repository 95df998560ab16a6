//! Clubkit API server

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clubkit_api::{routes, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = clubkit_shared::db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    clubkit_shared::db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(pool, config);
    let router = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;

    tracing::info!(bind_address = %bind_address, "Clubkit API listening");

    axum::serve(listener, router)
        .await
        .context("Server error")?;

    Ok(())
}
