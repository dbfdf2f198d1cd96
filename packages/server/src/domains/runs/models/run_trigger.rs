//! Webhook trigger dedup rows.
//!
//! `(provider, event_key)` is unique; inserting a duplicate returns the run
//! that the first delivery created. This is the whole webhook idempotency
//! mechanism, so it must run inside the same transaction that inserts the run.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RunTrigger {
    pub provider: String,
    pub event_key: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl RunTrigger {
    /// Deterministic event key for a normalized webhook delivery.
    /// Pure function of `(repo_id, commit_sha, event_type, pr_number?)`.
    pub fn event_key(
        repo_id: &str,
        commit_sha: &str,
        event_type: &str,
        pr_number: Option<i64>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(repo_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(commit_sha.as_bytes());
        hasher.update([0u8]);
        hasher.update(event_type.as_bytes());
        hasher.update([0u8]);
        if let Some(pr) = pr_number {
            hasher.update(pr.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Claim the trigger for `run_id`. Returns `None` when this delivery won
    /// the insert, or `Some(existing_run_id)` when a previous delivery did.
    pub async fn claim(
        conn: &mut PgConnection,
        provider: &str,
        event_key: &str,
        run_id: Uuid,
    ) -> Result<Option<Uuid>> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO run_triggers (provider, event_key, run_id, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (provider, event_key) DO NOTHING
            "#,
        )
        .bind(provider)
        .bind(event_key)
        .bind(run_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted > 0 {
            return Ok(None);
        }

        let existing = sqlx::query_scalar::<_, Uuid>(
            "SELECT run_id FROM run_triggers WHERE provider = $1 AND event_key = $2",
        )
        .bind(provider)
        .bind(event_key)
        .fetch_one(&mut *conn)
        .await?;

        Ok(Some(existing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_key_is_deterministic() {
        let a = RunTrigger::event_key("acme/widgets", "deadbeef", "push", None);
        let b = RunTrigger::event_key("acme/widgets", "deadbeef", "push", None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn event_key_varies_with_each_input() {
        let base = RunTrigger::event_key("acme/widgets", "deadbeef", "push", None);
        assert_ne!(
            base,
            RunTrigger::event_key("acme/gears", "deadbeef", "push", None)
        );
        assert_ne!(
            base,
            RunTrigger::event_key("acme/widgets", "cafef00d", "push", None)
        );
        assert_ne!(
            base,
            RunTrigger::event_key("acme/widgets", "deadbeef", "pull_request", None)
        );
        assert_ne!(
            base,
            RunTrigger::event_key("acme/widgets", "deadbeef", "push", Some(7))
        );
    }

    #[test]
    fn event_key_distinguishes_pr_numbers() {
        let pr7 = RunTrigger::event_key("acme/widgets", "deadbeef", "pull_request", Some(7));
        let pr8 = RunTrigger::event_key("acme/widgets", "deadbeef", "pull_request", Some(8));
        assert_ne!(pr7, pr8);
    }
}
