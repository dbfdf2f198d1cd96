//! Periodic sweeps: lease expiry, run timeout, forced cancel, and retry of
//! unreported terminal runs. Each tick is bounded and every failure is
//! logged and skipped; the next tick picks up where this one left off.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::models::Job;
use super::store::{self, ExpireOutcome};
use crate::domains::orchestrator::Orchestrator;
use crate::domains::runs::models::Run;
use crate::kernel::service_host::Service;

pub struct LeaseSweeper {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    batch_size: i64,
}

impl LeaseSweeper {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let config = &orchestrator.kernel().config;
        let interval = config.lease_sweep_interval;
        let batch_size = config.lease_sweep_batch_size;
        Self {
            orchestrator,
            interval,
            batch_size,
        }
    }

    async fn sweep_expired_leases(&self) -> Result<()> {
        let kernel = self.orchestrator.kernel();
        let now = Utc::now();
        let due = store::find_expirable_lease_ids(&kernel.db_pool, now, self.batch_size).await?;

        for lease_id in due {
            match store::expire_lease(&kernel.db_pool, &lease_id, now).await {
                Ok(ExpireOutcome::Requeued) => {
                    kernel.metrics.leases_expired.fetch_add(1, Ordering::Relaxed);
                    debug!(lease_id = %lease_id, "expired lease; attempt requeued");
                }
                Ok(ExpireOutcome::ExpiredOnly) => {
                    kernel.metrics.leases_expired.fetch_add(1, Ordering::Relaxed);
                }
                Ok(ExpireOutcome::Skipped) => {}
                Err(e) => {
                    error!(lease_id = %lease_id, error = %e, "lease expiry failed");
                }
            }
        }
        Ok(())
    }

    async fn sweep_run_timeouts(&self) -> Result<()> {
        let kernel = self.orchestrator.kernel();
        let cutoff = Utc::now() - chrono::Duration::seconds(kernel.config.max_run_seconds);
        let overdue = Run::find_running_older_than(cutoff, self.batch_size, &kernel.db_pool).await?;

        for run in overdue {
            if let Err(e) = self.orchestrator.timeout_run(run.id).await {
                error!(run_id = %run.id, error = %e, "run timeout sweep failed");
            }
        }
        Ok(())
    }

    async fn sweep_forced_cancels(&self) -> Result<()> {
        let kernel = self.orchestrator.kernel();
        let cutoff = Utc::now() - chrono::Duration::seconds(kernel.config.cancel_deadline_seconds);
        let stuck =
            Job::find_cancel_requested_older_than(cutoff, self.batch_size, &kernel.db_pool).await?;

        for job in stuck {
            debug!(job_id = %job.id, "cancel deadline passed; forcing cancel");
            if let Err(e) = self.orchestrator.force_cancel_job(job.id).await {
                error!(job_id = %job.id, error = %e, "forced cancel failed");
            }
        }
        Ok(())
    }

    async fn sweep_unreported_runs(&self) -> Result<()> {
        let kernel = self.orchestrator.kernel();
        let unreported = Run::find_unreported(self.batch_size, &kernel.db_pool).await?;
        for run in unreported {
            self.orchestrator.report_run(run).await;
        }
        Ok(())
    }

    async fn tick(&self) {
        if let Err(e) = self.sweep_expired_leases().await {
            error!(error = %e, "lease sweep failed");
        }
        if let Err(e) = self.sweep_run_timeouts().await {
            error!(error = %e, "run timeout sweep failed");
        }
        if let Err(e) = self.sweep_forced_cancels().await {
            error!(error = %e, "forced cancel sweep failed");
        }
        if let Err(e) = self.sweep_unreported_runs().await {
            error!(error = %e, "report sweep failed");
        }
    }
}

#[async_trait]
impl Service for LeaseSweeper {
    fn name(&self) -> &'static str {
        "lease-sweeper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(interval_ms = self.interval.as_millis() as u64, "lease sweeper starting");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("lease sweeper stopped");
        Ok(())
    }
}
