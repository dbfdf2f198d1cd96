//! Rerun idempotency rows: `(original_run_id, idempotency_key)` -> new run.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RunRerun {
    pub original_run_id: Uuid,
    pub idempotency_key: String,
    pub new_run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl RunRerun {
    /// Claim the rerun slot for `new_run_id`. Returns `None` when this call
    /// won the insert, or `Some(prior_new_run_id)` for a duplicate key.
    pub async fn claim(
        conn: &mut PgConnection,
        original_run_id: Uuid,
        idempotency_key: &str,
        new_run_id: Uuid,
    ) -> Result<Option<Uuid>> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO run_reruns (original_run_id, idempotency_key, new_run_id, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (original_run_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(original_run_id)
        .bind(idempotency_key)
        .bind(new_run_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted > 0 {
            return Ok(None);
        }

        let existing = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT new_run_id FROM run_reruns
            WHERE original_run_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(original_run_id)
        .bind(idempotency_key)
        .fetch_one(&mut *conn)
        .await?;

        Ok(Some(existing))
    }
}
