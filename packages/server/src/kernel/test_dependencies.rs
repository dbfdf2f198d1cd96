//! Test implementations of the kernel capabilities.
//!
//! Used by the integration harness; kept in the main tree so downstream
//! crates can drive the control plane without external services.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use super::traits::{BaseAI, BaseLeaseTokens, BaseRunnerDispatcher, BaseStatusReporter};
use crate::config::{AiConfig, Config};
use crate::domains::planner::{BasePlanner, Plan, PlanRequest};
use crate::domains::runs::models::Run;
use crate::protocol::LeaseGranted;

/// Planner that returns a fixed plan for every request.
pub struct FixedPlanner {
    pub plan: Plan,
}

#[async_trait]
impl BasePlanner for FixedPlanner {
    async fn plan(&self, _request: &PlanRequest) -> Result<Plan> {
        Ok(self.plan.clone())
    }
}

/// Planner that always fails, for exercising the PLAN_FAILED path.
pub struct FailingPlanner;

#[async_trait]
impl BasePlanner for FailingPlanner {
    async fn plan(&self, _request: &PlanRequest) -> Result<Plan> {
        Err(anyhow!("planner unavailable"))
    }
}

/// Dispatcher that records every grant instead of delivering it.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub grants: Mutex<Vec<LeaseGranted>>,
}

#[async_trait]
impl BaseRunnerDispatcher for RecordingDispatcher {
    async fn dispatch(&self, grant: &LeaseGranted) -> Result<()> {
        self.grants.lock().unwrap().push(grant.clone());
        Ok(())
    }
}

impl RecordingDispatcher {
    pub fn take_grants(&self) -> Vec<LeaseGranted> {
        std::mem::take(&mut *self.grants.lock().unwrap())
    }
}

/// Status reporter that records `(run_id, state)` pairs.
#[derive(Default)]
pub struct RecordingStatusReporter {
    pub reports: Mutex<Vec<(Uuid, String)>>,
}

#[async_trait]
impl BaseStatusReporter for RecordingStatusReporter {
    async fn report(&self, run: &Run) -> Result<()> {
        self.reports
            .lock()
            .unwrap()
            .push((run.id, run.state.as_str().to_string()));
        Ok(())
    }
}

/// Predictable lease tokens for assertions.
#[derive(Default)]
pub struct SequentialLeaseTokens {
    counter: AtomicU64,
}

impl BaseLeaseTokens for SequentialLeaseTokens {
    fn mint(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("ls_test_{n:08}")
    }
}

/// AI client returning a canned answer.
pub struct StaticAI {
    pub output: String,
}

#[async_trait]
impl BaseAI for StaticAI {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(self.output.clone())
    }
}

/// AI client that always errors, for breaker tests.
pub struct FailingAI;

#[async_trait]
impl BaseAI for FailingAI {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(anyhow!("provider down"))
    }
}

/// Config with tight timings suitable for tests.
pub fn test_config(database_url: &str) -> Config {
    Config {
        database_url: database_url.to_string(),
        listen_addr: "127.0.0.1:0".to_string(),
        webhook_secret: None,
        webhook_max_body_bytes: 1024 * 1024,
        repo_root: "/nonexistent/test-repos".to_string(),
        default_lease_ttl_seconds: 120,
        default_heartbeat_interval_seconds: 30,
        queue_visibility_timeout_seconds: 5,
        lease_sweep_interval: Duration::from_millis(100),
        lease_sweep_batch_size: 25,
        cancel_deadline_seconds: 30,
        max_run_seconds: 3600,
        max_job_attempts: 3,
        dispatch_workers: 1,
        ai: AiConfig {
            enabled: false,
            provider: "test".to_string(),
            model: "test".to_string(),
            endpoint: String::new(),
            token: None,
            prompt_version: "v1".to_string(),
            timeout: Duration::from_secs(1),
            max_output_len: 4096,
            max_cache_events: 10,
            circuit_failures: 3,
            cooldown: Duration::from_secs(300),
        },
    }
}
