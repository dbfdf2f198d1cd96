//! Application setup and server configuration.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::domains::orchestrator::Orchestrator;
use crate::kernel::service_host::Service;
use crate::kernel::ServerKernel;
use crate::server::routes::{
    cancel_run_handler, create_run_handler, get_run_handler, health_handler, metrics_handler,
    protocol_ack_lease, protocol_cancel_ack, protocol_complete, protocol_heartbeat,
    rerun_run_handler, webhook_handler,
};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<ServerKernel>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(kernel: Arc<ServerKernel>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            kernel,
            orchestrator,
        }
    }
}

/// Build the application router.
pub fn build_app(state: AppState) -> Router {
    let webhook_limit = state.kernel.config.webhook_max_body_bytes;

    let webhooks = Router::new()
        .route("/webhooks/:provider", post(webhook_handler))
        .layer(DefaultBodyLimit::max(webhook_limit));

    let api = Router::new()
        .route("/runs", post(create_run_handler))
        .route("/runs/:run_id", get(get_run_handler))
        .route("/runs/:run_id/cancel", post(cancel_run_handler))
        .route("/runs/:run_id/rerun", post(rerun_run_handler))
        .route("/internal/ack-lease", post(protocol_ack_lease))
        .route("/internal/heartbeat", post(protocol_heartbeat))
        .route("/internal/complete", post(protocol_complete))
        .route("/internal/cancel-ack", post(protocol_cancel_ack))
        .merge(webhooks);

    Router::new()
        .nest("/api/v1", api)
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The HTTP listener as a hosted service with graceful shutdown.
pub struct HttpServer {
    listener: tokio::net::TcpListener,
    router: Router,
}

impl HttpServer {
    pub fn new(listener: tokio::net::TcpListener, router: Router) -> Self {
        Self { listener, router }
    }
}

#[async_trait]
impl Service for HttpServer {
    fn name(&self) -> &'static str {
        "http-server"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, "http server listening");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}
