use anyhow::Context;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use orders_rs::{config::Config, db, router, shutdown::shutdown_signal, AppState, OrderRepository};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %format!("{e:#}"), "Orders service failed to start");
        eprintln!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    tracing::info!("Starting orders service...");

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        tracing_enabled = config.tracing_enabled,
        "Configuration loaded"
    );

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running migrations...");
    db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let state = AppState {
        repository: OrderRepository::new(pool.clone()),
        tracer: config.tracer("orders-service"),
    };
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    tracing::info!("Orders service listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    pool.close().await;
    tracing::info!("Orders service stopped");
    Ok(())
}
