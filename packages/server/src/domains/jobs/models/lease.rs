//! Lease model and lease state machine.
//!
//! A lease is a time-bounded, exclusive right for one runner to execute and
//! finalize one attempt. The lease id doubles as the fencing token: it is an
//! unguessable secret, never exposed through the public API, and every runner
//! message is validated against the lease's state and expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "snake_case")]
pub enum LeaseState {
    #[default]
    Granted,
    Active,
    Expired,
    Completed,
    Canceled,
    Revoked,
}

impl LeaseState {
    pub fn can_transition_to(self, next: LeaseState) -> bool {
        use LeaseState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Granted, Active)
                | (Granted, Expired)
                | (Granted, Revoked)
                | (Active, Expired)
                | (Active, Completed)
                | (Active, Canceled)
                | (Active, Revoked)
        )
    }

    /// A live lease holds (or may claim) runner authority.
    pub fn is_live(self) -> bool {
        matches!(self, LeaseState::Granted | LeaseState::Active)
    }

    pub fn as_str(self) -> &'static str {
        use LeaseState::*;
        match self {
            Granted => "granted",
            Active => "active",
            Expired => "expired",
            Completed => "completed",
            Canceled => "canceled",
            Revoked => "revoked",
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Lease {
    /// Unguessable token, `ls_` + 64 hex chars. Treated as a secret.
    pub id: String,
    pub job_attempt_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub runner_id: Option<String>,

    #[builder(default)]
    pub state: LeaseState,
    pub ttl_seconds: i64,
    pub heartbeat_interval_seconds: i64,

    #[builder(default = Utc::now())]
    pub granted_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }
}
