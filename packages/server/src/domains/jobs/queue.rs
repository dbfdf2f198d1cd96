//! Postgres-backed dispatch queue, co-located with the state store.
//!
//! Rows exist only while an attempt is QUEUED. Delivery is at-least-once:
//! a row becomes invisible for the visibility timeout after a dequeue, and
//! duplicate deliveries are made safe downstream by the lease uniqueness
//! constraint. Dequeue order is `(available_at, attempt_id)` so concurrent
//! workers make a stable, deterministic pick; `FOR UPDATE SKIP LOCKED`
//! keeps their picks disjoint.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::common::error::CoreError;

/// Run states under which queue rows are swept instead of dispatched.
const UNDISPATCHABLE_RUN_STATES: &str =
    "('success', 'failed', 'canceled', 'timeout', 'reported', 'plan_failed', 'cancel_requested')";

#[derive(FromRow, Debug, Clone)]
pub struct QueueRow {
    pub attempt_id: Uuid,
    pub available_at: DateTime<Utc>,
    pub inflight_until: Option<DateTime<Utc>>,
    pub delivery_count: i32,
    pub last_delivered_at: Option<DateTime<Utc>>,
}

/// Upsert a queue row for an attempt, making it immediately (or later, for
/// backoff) available and clearing any in-flight marker.
pub async fn enqueue(
    conn: &mut PgConnection,
    attempt_id: Uuid,
    available_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO job_queue (attempt_id, available_at, inflight_until, delivery_count)
        VALUES ($1, $2, NULL, 0)
        ON CONFLICT (attempt_id) DO UPDATE SET
            available_at = EXCLUDED.available_at,
            inflight_until = NULL
        "#,
    )
    .bind(attempt_id)
    .bind(available_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Remove the row for an attempt. Invoked after a lease grant succeeds.
pub async fn ack(conn: &mut PgConnection, attempt_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM job_queue WHERE attempt_id = $1")
        .bind(attempt_id)
        .execute(conn)
        .await?;

    Ok(())
}

/// Delete rows whose attempts are no longer QUEUED or whose runs left
/// dispatchable states. Returns the number of rows swept.
pub async fn sweep_orphans(conn: &mut PgConnection) -> Result<u64> {
    let swept = sqlx::query(&format!(
        r#"
        DELETE FROM job_queue q
        USING job_attempts a, jobs j, runs r
        WHERE q.attempt_id = a.id
          AND a.job_id = j.id
          AND j.run_id = r.id
          AND (a.state <> 'queued' OR r.state IN {UNDISPATCHABLE_RUN_STATES})
        "#
    ))
    .execute(conn)
    .await?
    .rows_affected();

    Ok(swept)
}

/// Dequeue the next ready attempt: sweep orphaned rows, then pick the
/// earliest visible row and mark it in flight for `visibility_timeout`.
/// Returns `CoreError::QueueEmpty` when nothing is ready — a signal, not a
/// failure.
pub async fn dequeue(pool: &PgPool, visibility_timeout_seconds: i64) -> Result<Uuid, CoreError> {
    let mut tx = pool.begin().await?;

    let swept = sweep_orphans(&mut tx).await.map_err(CoreError::Internal)?;
    if swept > 0 {
        tracing::debug!(swept, "swept orphaned queue rows");
    }

    let row = sqlx::query_as::<_, QueueRow>(&format!(
        r#"
        SELECT q.attempt_id, q.available_at, q.inflight_until, q.delivery_count, q.last_delivered_at
        FROM job_queue q
        JOIN job_attempts a ON a.id = q.attempt_id
        JOIN jobs j ON j.id = a.job_id
        JOIN runs r ON r.id = j.run_id
        WHERE q.available_at <= NOW()
          AND (q.inflight_until IS NULL OR q.inflight_until <= NOW())
          AND a.state = 'queued'
          AND r.state NOT IN {UNDISPATCHABLE_RUN_STATES}
        ORDER BY q.available_at, q.attempt_id
        LIMIT 1
        FOR UPDATE OF q SKIP LOCKED
        "#
    ))
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Err(CoreError::QueueEmpty);
    };

    sqlx::query(
        r#"
        UPDATE job_queue
        SET delivery_count = delivery_count + 1,
            inflight_until = NOW() + ($1 || ' seconds')::INTERVAL,
            last_delivered_at = NOW()
        WHERE attempt_id = $2
        "#,
    )
    .bind(visibility_timeout_seconds.to_string())
    .bind(row.attempt_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(row.attempt_id)
}

/// Exponential retry backoff, capped at one hour.
pub fn retry_backoff_seconds(prior_attempts: i32) -> i64 {
    2i64.pow(prior_attempts.clamp(0, 30) as u32).min(3600)
}
