//! Outbox relay process
//!
//! Polls the orders service's outbox table and publishes pending events to
//! the bus until Ctrl-C or SIGTERM.

use anyhow::Context;
use event_bus::EventBus;
use outbox::{OutboxRelay, PgOutboxStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use orders_rs::{bus::connect_bus, config::Config, db, shutdown::cancel_on_shutdown};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %format!("{e:#}"), "Outbox relay failed");
        eprintln!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let bus = connect_bus(&config)
        .await
        .context("Failed to connect to event bus")?;

    let relay = OutboxRelay::new(
        Arc::new(PgOutboxStore::new(pool.clone())),
        bus.clone(),
        config.tracer("outbox-relay"),
    )
    .with_batch_limit(config.batch_limit);

    let shutdown = cancel_on_shutdown();
    relay.run(config.poll_interval, shutdown).await;

    // Release connections on the way out
    if let Err(e) = bus.close().await {
        tracing::warn!(error = %e, "Failed to close event bus cleanly");
    }
    pool.close().await;

    Ok(())
}
