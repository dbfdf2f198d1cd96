//! Long-running background services with coordinated shutdown.
//!
//! Each service is an independent task with an explicit stop signal; the
//! host cancels every service on ctrl-c (or an external trigger) and waits
//! for them to drain.

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running background service.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    /// Run until completion or until `shutdown` is cancelled.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Hosts a set of services and shuts them down together.
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service(mut self, service: Box<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Token the host cancels on shutdown; hand to tasks managed elsewhere.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn spawn_all(self) -> (Vec<JoinHandle<()>>, CancellationToken) {
        let shutdown = self.shutdown;
        let handles = self
            .services
            .into_iter()
            .map(|service| {
                let name = service.name();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    info!(service = name, "service starting");
                    if let Err(e) = service.run(token).await {
                        error!(service = name, error = %e, "service exited with error");
                    } else {
                        info!(service = name, "service stopped");
                    }
                })
            })
            .collect();
        (handles, shutdown)
    }

    /// Run all services until ctrl-c, then cancel and wait for them.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let (handles, shutdown) = self.spawn_all();

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        shutdown.cancel();

        futures::future::join_all(handles).await;
        Ok(())
    }

    /// Run all services until `stop` fires. Used by tests and embedding.
    pub async fn run_until_cancelled(self, stop: CancellationToken) -> Result<()> {
        let (handles, shutdown) = self.spawn_all();

        stop.cancelled().await;
        shutdown.cancel();

        futures::future::join_all(handles).await;
        Ok(())
    }
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}
