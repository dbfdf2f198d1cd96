//! Runner protocol messages (JSON at the boundary).
//!
//! Inbound messages decode strictly: unknown fields are rejected so a
//! runner/control-plane version skew fails loudly instead of silently
//! dropping data. Outbound enums render SCREAMING_SNAKE_CASE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::error::StaleLeaseReason;
use crate::domains::jobs::models::JobSpec;

/// Control plane -> runner: you hold the lease, here is the work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseGranted {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub lease_id: String,
    pub lease_ttl_seconds: i64,
    pub heartbeat_interval_seconds: i64,
    pub max_runtime_seconds: i64,
    pub job_spec: JobSpec,
}

/// Runner -> control plane: lease accepted, execution starting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AckLease {
    pub lease_id: String,
    pub runner_id: String,
}

/// Runner -> control plane: still alive; extend the lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Heartbeat {
    pub lease_id: String,
    pub runner_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Succeeded,
    Failed,
}

/// Wall-clock facts about an attempt's execution, as measured by the runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timings {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactRef {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub uri: String,
}

/// Runner -> control plane: the attempt finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Complete {
    pub lease_id: String,
    pub runner_id: String,
    pub status: CompletionStatus,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timings: Option<Timings>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    pub summary: Option<String>,
}

/// Runner -> control plane: cancel observed, execution stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelAck {
    pub lease_id: String,
    pub runner_id: String,
}

/// Control plane -> runner: heartbeat reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub extend_lease: bool,
    pub new_lease_ttl_seconds: i64,
    pub cancel_requested: bool,
    pub cancel_deadline_seconds: i64,
}

/// Control plane -> runner: your lease no longer carries authority.
/// Explicit so the runner can self-terminate instead of guessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleLease {
    pub lease_id: String,
    pub reason: StaleLeaseReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_messages_reject_unknown_fields() {
        let err = serde_json::from_value::<AckLease>(serde_json::json!({
            "lease_id": "ls_x",
            "runner_id": "r1",
            "extra": true,
        }));
        assert!(err.is_err());

        let err = serde_json::from_value::<Complete>(serde_json::json!({
            "lease_id": "ls_x",
            "runner_id": "r1",
            "status": "SUCCEEDED",
            "exit_code": 0,
            "summary": null,
            "unexpected": 1,
        }));
        assert!(err.is_err());
    }

    #[test]
    fn completion_status_uses_screaming_case() {
        let complete: Complete = serde_json::from_value(serde_json::json!({
            "lease_id": "ls_x",
            "runner_id": "r1",
            "status": "FAILED",
            "exit_code": 137,
            "summary": "process killed",
        }))
        .unwrap();
        assert_eq!(complete.status, CompletionStatus::Failed);
        assert!(serde_json::from_str::<CompletionStatus>("\"failed\"").is_err());
    }

    #[test]
    fn artifact_type_field_is_named_type() {
        let artifact: ArtifactRef =
            serde_json::from_value(serde_json::json!({"type": "log", "uri": "s3://b/k"})).unwrap();
        assert_eq!(artifact.artifact_type, "log");
    }

    #[test]
    fn stale_lease_reason_renders_screaming() {
        let stale = StaleLease {
            lease_id: "ls_x".into(),
            reason: StaleLeaseReason::UnknownLease,
        };
        let json = serde_json::to_value(&stale).unwrap();
        assert_eq!(json["reason"], "UNKNOWN_LEASE");
    }
}
