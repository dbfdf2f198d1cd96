//! Dequeue worker: polls the dispatch queue, grants leases, and hands the
//! resulting `LeaseGranted` to the runner dispatcher. One instance per
//! configured worker; concurrent workers see disjoint rows thanks to
//! SKIP LOCKED in the queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domains::orchestrator::Orchestrator;
use crate::kernel::service_host::Service;

pub struct DispatchWorker {
    orchestrator: Arc<Orchestrator>,
    worker_id: String,
    /// Sleep when the queue is empty.
    idle_interval: Duration,
}

impl DispatchWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, index: usize) -> Self {
        Self {
            orchestrator,
            worker_id: format!("dispatch-{index}"),
            idle_interval: Duration::from_millis(500),
        }
    }

    async fn tick(&self) -> Result<bool> {
        let Some(grant) = self.orchestrator.grant_next_lease().await? else {
            return Ok(false);
        };

        self.orchestrator
            .kernel()
            .dispatcher
            .dispatch(&grant)
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl Service for DispatchWorker {
    fn name(&self) -> &'static str {
        "dispatch-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.worker_id, "dispatch worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.tick().await {
                // Dispatched something: immediately look for more work.
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "dispatch tick failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "dispatch worker stopped");
        Ok(())
    }
}
