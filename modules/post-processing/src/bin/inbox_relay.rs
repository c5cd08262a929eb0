//! Inbox relay process
//!
//! Polls unprocessed inbox rows and runs the order business handlers for
//! them until Ctrl-C or SIGTERM.

use anyhow::Context;
use inbox::{InboxRelay, PgInboxStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use post_processing_rs::{build_registry, config::Config, db, shutdown::cancel_on_shutdown};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %format!("{e:#}"), "Inbox relay failed");
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

    let relay = InboxRelay::new(
        Arc::new(PgInboxStore::new(pool.clone())),
        build_registry(),
        config.tracer("inbox-relay"),
    )
    .with_batch_limit(config.batch_limit);

    relay.run(config.poll_interval, cancel_on_shutdown()).await;

    pool.close().await;
    Ok(())
}
