//! Inbox consumer process
//!
//! Takes order events off the bus and records them in the inbox table,
//! acking each message only after its row is stored.

use anyhow::Context;
use inbox::{InboxConsumer, InboxRecorder, PgInboxStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use post_processing_rs::{bus::connect_bus, config::Config, db, shutdown::cancel_on_shutdown};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %format!("{e:#}"), "Inbox consumer failed");
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

    let consumer = InboxConsumer::new(bus, config.subscription());
    let recorder = InboxRecorder::new(
        Arc::new(PgInboxStore::new(pool.clone())),
        config.tracer("post-processing-service"),
    );

    let result = consumer.consume(&recorder, cancel_on_shutdown()).await;

    // Close the broker connection whether consuming ended cleanly or not
    if let Err(e) = consumer.close().await {
        tracing::warn!(error = %e, "Failed to close event bus cleanly");
    }
    pool.close().await;

    result.context("Inbox consumer stopped with an error")
}
