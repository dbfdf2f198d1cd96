// Main entry point for the Delta CI control plane

use std::sync::Arc;

use anyhow::{Context, Result};
use delta_core::domains::jobs::dispatcher::DispatchWorker;
use delta_core::domains::jobs::sweeper::LeaseSweeper;
use delta_core::domains::orchestrator::Orchestrator;
use delta_core::kernel::{ServerKernel, ServiceHost};
use delta_core::server::{build_app, AppState, HttpServer};
use delta_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,delta_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Delta CI control plane");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let listen_addr = config.listen_addr.clone();
    let dispatch_workers = config.dispatch_workers;

    let kernel = Arc::new(
        ServerKernel::with_defaults(pool, config).context("Failed to build server kernel")?,
    );
    let orchestrator = Arc::new(Orchestrator::new(kernel.clone()));

    let app = build_app(AppState::new(kernel, orchestrator.clone()));
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;
    tracing::info!("Listening on {listen_addr}");

    let mut host = ServiceHost::new()
        .with_service(Box::new(HttpServer::new(listener, app)))
        .with_service(Box::new(LeaseSweeper::new(orchestrator.clone())));
    for index in 0..dispatch_workers {
        host = host.with_service(Box::new(DispatchWorker::new(orchestrator.clone(), index)));
    }

    host.run_until_shutdown().await
}
