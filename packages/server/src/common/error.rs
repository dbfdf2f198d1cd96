//! Structured error taxonomy for the control plane.
//!
//! Store and orchestrator operations return `CoreError` so callers can
//! discriminate outcomes the protocol cares about (stale lease, invalid
//! transition, not found). The HTTP layer maps these onto the API error
//! envelope; background services log and continue.

use thiserror::Error;

/// A rejected state transition. Carries enough context to be actionable in
/// logs and API responses. The row is never mutated when this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub entity: &'static str,
    pub id: String,
    pub from: String,
    pub to: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid {} transition {} -> {} (id {})",
            self.entity, self.from, self.to, self.id
        )
    }
}

/// Why a lease-fenced message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StaleLeaseReason {
    LeaseExpired,
    LeaseRevoked,
    UnknownLease,
}

/// Errors surfaced by the state store and orchestrator.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Transition(TransitionError),

    #[error("stale lease {lease_id}: {reason:?}")]
    StaleLease {
        lease_id: String,
        reason: StaleLeaseReason,
    },

    /// Signal, not a failure: the dispatch queue had no ready row.
    #[error("queue empty")]
    QueueEmpty,

    #[error("AI advisor unavailable: {0}")]
    AiUnavailable(String),

    #[error("AI circuit breaker open")]
    AiCircuitOpen,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// True for errors a caller may retry without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Database(_) | CoreError::QueueEmpty)
    }
}
