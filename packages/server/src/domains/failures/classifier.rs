//! Deterministic rule-based failure classification.
//!
//! The rules are ordered; the first match wins. Classification is a pure
//! function of its sanitized inputs, so the same attempt always produces
//! the same `(category, confidence, summary)`.

use serde::{Deserialize, Serialize};

use super::sanitize::sanitize;
use crate::domains::jobs::models::{FailureCategory, FailureConfidence};

const SUMMARY_MAX_LEN: usize = 512;

/// Sanitized facts about a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureFacts {
    pub job_name: String,
    pub exit_code: Option<i32>,
    pub summary: String,
    pub attempt_number: i32,
    pub duration_seconds: Option<i64>,
    pub artifact_types: Vec<String>,
    pub cache_events: Vec<String>,
    /// True when the attempt finished on the cancel path.
    pub canceled: bool,
    /// True when the control plane timed the attempt out.
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: FailureCategory,
    pub confidence: FailureConfidence,
    pub summary: String,
}

const NETWORK_KEYWORDS: &[&str] = &[
    "connection refused",
    "connection reset",
    "network is unreachable",
    "no such host",
    "dns",
    "tls handshake",
    "i/o timeout",
    "dial tcp",
    "temporary failure in name resolution",
];

const OOM_KEYWORDS: &[&str] = &["out of memory", "oom", "killed", "cannot allocate memory"];

/// Classify a failed attempt. First matching rule wins.
pub fn classify(facts: &FailureFacts) -> Classification {
    let summary = sanitize(&facts.summary, SUMMARY_MAX_LEN);
    let lower = summary.to_lowercase();
    let job = facts.job_name.to_lowercase();

    if facts.canceled {
        return Classification {
            category: FailureCategory::Canceled,
            confidence: FailureConfidence::High,
            summary: format!("Canceled: {}", or_none(&summary)),
        };
    }

    if facts.timed_out || facts.exit_code == Some(124) || lower.contains("timed out") {
        return Classification {
            category: FailureCategory::Infra,
            confidence: FailureConfidence::Medium,
            summary: format!("Timeout: {}", or_none(&summary)),
        };
    }

    if facts.exit_code == Some(137) || OOM_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Classification {
            category: FailureCategory::Infra,
            confidence: FailureConfidence::High,
            summary: format!("Resource exhaustion: {}", or_none(&summary)),
        };
    }

    if NETWORK_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Classification {
            category: FailureCategory::Infra,
            confidence: FailureConfidence::High,
            summary: format!("Network failure: {}", or_none(&summary)),
        };
    }

    if lower.contains("command not found") || lower.contains("executable file not found") {
        return Classification {
            category: FailureCategory::Tooling,
            confidence: FailureConfidence::High,
            summary: format!("Missing tool: {}", or_none(&summary)),
        };
    }

    if lower.contains("permission denied") {
        return Classification {
            category: FailureCategory::Tooling,
            confidence: FailureConfidence::Medium,
            summary: format!("Permission problem: {}", or_none(&summary)),
        };
    }

    if job.contains("lint") || job.contains("test") || job.contains("build") {
        let kind = if job.contains("lint") {
            "Lint"
        } else if job.contains("test") {
            "Test"
        } else {
            "Build"
        };
        return Classification {
            category: FailureCategory::User,
            confidence: FailureConfidence::Medium,
            summary: format!("{kind} failure: {}", or_none(&summary)),
        };
    }

    Classification {
        category: FailureCategory::User,
        confidence: FailureConfidence::Low,
        summary: format!("Job failed: {}", or_none(&summary)),
    }
}

fn or_none(summary: &str) -> &str {
    if summary.is_empty() {
        "no summary reported"
    } else {
        summary
    }
}
