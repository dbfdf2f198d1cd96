//! Job model and the shared job/attempt state machine.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// States for jobs and job attempts (both walk the same table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Created,
    Queued,
    Leased,
    Starting,
    Running,
    Uploading,
    Succeeded,
    Failed,
    TimedOut,
    CancelRequested,
    Canceled,
}

impl JobState {
    /// Whether `self -> next` is a documented transition. Self-loops are
    /// always valid. The `{LEASED,STARTING,RUNNING} -> QUEUED` edges are the
    /// lease-expiry recovery path; `{FAILED,TIMED_OUT} -> QUEUED` is retry.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Created, Queued) => true,
            (Queued, Leased) => true,
            (Leased, Starting) => true,
            (Starting, Running) => true,
            (Running, Uploading) => true,
            (Uploading, Succeeded) | (Uploading, Failed) => true,
            // Lease expiry hands the work back to the queue.
            (Leased, Queued) | (Starting, Queued) | (Running, Queued) => true,
            (Running, TimedOut) => true,
            // Retry when attempts remain.
            (Failed, Queued) | (TimedOut, Queued) => true,
            // Cancel path: any non-terminal state may be asked to cancel.
            (Created | Queued | Leased | Starting | Running | Uploading | Failed | TimedOut, CancelRequested) => true,
            (CancelRequested, Canceled) => true,
            // Non-started work cancels without a round trip to the runner.
            (Created, Canceled) | (Queued, Canceled) => true,
            _ => false,
        }
    }

    /// States with no further progress absent a retry.
    pub fn is_terminal(self) -> bool {
        use JobState::*;
        matches!(self, Succeeded | Failed | TimedOut | Canceled)
    }

    /// States where a runner currently holds (or recently held) the work.
    pub fn is_executing(self) -> bool {
        use JobState::*;
        matches!(self, Leased | Starting | Running | Uploading)
    }

    /// States eligible to sit in (or enter) the dispatch queue.
    pub fn is_queuable(self) -> bool {
        use JobState::*;
        matches!(self, Created | Queued)
    }

    pub fn as_str(self) -> &'static str {
        use JobState::*;
        match self {
            Created => "created",
            Queued => "queued",
            Leased => "leased",
            Starting => "starting",
            Running => "running",
            Uploading => "uploading",
            Succeeded => "succeeded",
            Failed => "failed",
            TimedOut => "timed_out",
            CancelRequested => "cancel_requested",
            Canceled => "canceled",
        }
    }
}

/// A logical unit of work in a run (build/test/lint). Concrete executions
/// are [`super::JobAttempt`] rows; the job tracks the rolled-up state.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub run_id: Uuid,
    pub name: String,
    /// Required jobs gate run success; others may fail without failing the run.
    #[builder(default = true)]
    pub required: bool,

    #[builder(default)]
    pub state: JobState,
    #[builder(default = 1)]
    pub attempt_count: i32,
    /// Why the planner emitted this job.
    pub reason: String,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub async fn find_by_run(run_id: Uuid, db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, run_id, name, required, state, attempt_count, reason, created_at, updated_at
            FROM jobs
            WHERE run_id = $1
            ORDER BY name
            "#,
        )
        .bind(run_id)
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }

    /// Jobs of a run stuck in CANCEL_REQUESTED since before `cutoff`.
    /// The forced-cancel sweep finishes these without a CancelAck.
    pub async fn find_cancel_requested_older_than(
        cutoff: DateTime<Utc>,
        limit: i64,
        db: &sqlx::PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, run_id, name, required, state, attempt_count, reason, created_at, updated_at
            FROM jobs
            WHERE state = 'cancel_requested' AND updated_at <= $1
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }

    pub async fn find_by_id(id: Uuid, db: &sqlx::PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, run_id, name, required, state, attempt_count, reason, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(job)
    }

    pub async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO jobs (id, run_id, name, required, state, attempt_count, reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, run_id, name, required, state, attempt_count, reason, created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(self.run_id)
        .bind(&self.name)
        .bind(self.required)
        .bind(self.state)
        .bind(self.attempt_count)
        .bind(&self.reason)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(job)
    }
}
