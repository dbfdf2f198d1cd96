//! Cache hit/miss/store events reported by runners. Advisory metadata only;
//! the failure analyzer feeds a bounded number of these into its prompt.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvent {
    pub id: Uuid,
    pub job_attempt_id: Uuid,
    pub cache_key: String,
    /// One of `hit`, `miss`, `store`.
    pub event: String,
    pub created_at: DateTime<Utc>,
}

impl CacheEvent {
    pub async fn record(
        job_attempt_id: Uuid,
        cache_key: &str,
        event: &str,
        db: &sqlx::PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_cache_events (id, job_attempt_id, cache_key, event, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_attempt_id)
        .bind(cache_key)
        .bind(event)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn find_by_attempt(
        job_attempt_id: Uuid,
        limit: i64,
        db: &sqlx::PgPool,
    ) -> Result<Vec<Self>> {
        let events = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_attempt_id, cache_key, event, created_at
            FROM job_cache_events
            WHERE job_attempt_id = $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(job_attempt_id)
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(events)
    }
}
