//! Plan, identifier, and protocol message fixtures.

use delta_core::domains::jobs::models::JobSpec;
use delta_core::domains::planner::{Plan, PlannedJob, RecipeSource};
use delta_core::protocol::{AckLease, CancelAck, Complete, CompletionStatus, Heartbeat};
use uuid::Uuid;

pub const RUNNER: &str = "runner-1";

pub fn ack_msg(lease_id: &str) -> AckLease {
    AckLease {
        lease_id: lease_id.to_string(),
        runner_id: RUNNER.to_string(),
    }
}

pub fn heartbeat_msg(lease_id: &str) -> Heartbeat {
    Heartbeat {
        lease_id: lease_id.to_string(),
        runner_id: RUNNER.to_string(),
    }
}

pub fn cancel_ack_msg(lease_id: &str) -> CancelAck {
    CancelAck {
        lease_id: lease_id.to_string(),
        runner_id: RUNNER.to_string(),
    }
}

pub fn complete_msg(lease_id: &str, status: CompletionStatus, exit_code: i32, summary: &str) -> Complete {
    Complete {
        lease_id: lease_id.to_string(),
        runner_id: RUNNER.to_string(),
        status,
        exit_code: Some(exit_code),
        timings: None,
        artifacts: vec![],
        summary: Some(summary.to_string()),
    }
}

/// Unique repo id per test so the shared database stays disjoint.
pub fn unique_repo() -> String {
    format!("acme/{}", Uuid::new_v4().simple())
}

/// Unique fake commit sha (hex, as validation requires).
pub fn unique_sha() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn planned_job(name: &str, required: bool, depends_on: &[&str]) -> PlannedJob {
    PlannedJob {
        name: name.to_string(),
        required,
        reason: format!("fixture job {name}"),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        spec: JobSpec {
            name: name.to_string(),
            workdir: ".".to_string(),
            steps: vec![format!("echo {name}")],
            env: Default::default(),
            caches: vec![],
            artifacts: vec![],
        },
    }
}

fn plan(jobs: Vec<PlannedJob>) -> Plan {
    Plan {
        jobs,
        explain: "fixture plan".to_string(),
        skipped_jobs: vec![],
        fingerprint: Some("fixturefingerprint".to_string()),
        recipe_source: RecipeSource::Discovery,
        recipe_id: None,
        recipe_version: None,
    }
}

/// One required `build` job.
pub fn single_job_plan() -> Plan {
    plan(vec![planned_job("build", true, &[])])
}

/// Two independent required jobs.
pub fn two_job_plan() -> Plan {
    plan(vec![
        planned_job("build", true, &[]),
        planned_job("docs", true, &[]),
    ])
}

/// `test` (required) and `lint` (allow-failure) gated on `build`.
pub fn dag_plan() -> Plan {
    plan(vec![
        planned_job("build", true, &[]),
        planned_job("test", true, &["build"]),
        planned_job("lint", false, &["build"]),
    ])
}
