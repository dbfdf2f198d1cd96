//! Run model and run state machine.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// States a run moves through. Stored snake_case in Postgres, rendered
/// SCREAMING_SNAKE_CASE at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Created,
    Planning,
    Queued,
    Running,
    Success,
    Failed,
    CancelRequested,
    Canceled,
    Timeout,
    PlanFailed,
    Reported,
}

impl RunState {
    /// Whether `self -> next` is a documented transition. Self-loops are
    /// always valid so repeated delivery of the same event is idempotent.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Created, Planning)
                | (Planning, Queued)
                | (Planning, PlanFailed)
                | (Queued, Running)
                | (Queued, CancelRequested)
                | (Running, Success)
                | (Running, Failed)
                | (Running, CancelRequested)
                | (Running, Timeout)
                | (CancelRequested, Canceled)
                | (PlanFailed, Failed)
                | (Success, Reported)
                | (Failed, Reported)
                | (Canceled, Reported)
                | (Timeout, Reported)
        )
    }

    /// Terminal outcome states. `PlanFailed` is excluded because it still
    /// owes a transition to `Failed`.
    pub fn is_terminal(self) -> bool {
        use RunState::*;
        matches!(self, Success | Failed | Canceled | Timeout | Reported)
    }

    /// Run states under which no attempt may be dispatched to a runner.
    pub fn blocks_dispatch(self) -> bool {
        use RunState::*;
        self.is_terminal() || matches!(self, PlanFailed | CancelRequested)
    }

    /// Outcome states that still need a status report posted.
    pub fn is_reportable(self) -> bool {
        use RunState::*;
        matches!(self, Success | Failed | Canceled | Timeout)
    }

    pub fn as_str(self) -> &'static str {
        use RunState::*;
        match self {
            Created => "created",
            Planning => "planning",
            Queued => "queued",
            Running => "running",
            Success => "success",
            Failed => "failed",
            CancelRequested => "cancel_requested",
            Canceled => "canceled",
            Timeout => "timeout",
            PlanFailed => "plan_failed",
            Reported => "reported",
        }
    }
}

/// One CI evaluation of a trigger (push, PR, manual, rerun). Owns its jobs.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Run {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub repo_id: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub commit_sha: String,

    #[builder(default)]
    pub state: RunState,

    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Find runs in RUNNING whose execution started before `cutoff`.
    /// Used by the run-timeout sweep.
    pub async fn find_running_older_than(
        cutoff: DateTime<Utc>,
        limit: i64,
        db: &sqlx::PgPool,
    ) -> Result<Vec<Self>> {
        let runs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, repo_id, git_ref, commit_sha, state, started_at, created_at, updated_at
            FROM runs
            WHERE state = 'running' AND started_at IS NOT NULL AND started_at <= $1
            ORDER BY started_at
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(runs)
    }

    /// Find terminal runs that have not been reported yet.
    pub async fn find_unreported(limit: i64, db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let runs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, repo_id, git_ref, commit_sha, state, started_at, created_at, updated_at
            FROM runs
            WHERE state IN ('success', 'failed', 'canceled', 'timeout')
            ORDER BY updated_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(runs)
    }

    pub async fn find_by_id(id: Uuid, db: &sqlx::PgPool) -> Result<Self> {
        let run = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, repo_id, git_ref, commit_sha, state, started_at, created_at, updated_at
            FROM runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(run)
    }

    pub async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let run = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO runs (id, repo_id, git_ref, commit_sha, state, started_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, repo_id, git_ref, commit_sha, state, started_at, created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(&self.repo_id)
        .bind(&self.git_ref)
        .bind(&self.commit_sha)
        .bind(self.state)
        .bind(self.started_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_transitions_are_valid() {
        use RunState::*;
        assert!(Created.can_transition_to(Planning));
        assert!(Planning.can_transition_to(Queued));
        assert!(Planning.can_transition_to(PlanFailed));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Timeout));
        assert!(Queued.can_transition_to(CancelRequested));
        assert!(CancelRequested.can_transition_to(Canceled));
        assert!(PlanFailed.can_transition_to(Failed));
        assert!(Success.can_transition_to(Reported));
    }

    #[test]
    fn undocumented_transitions_are_rejected() {
        use RunState::*;
        assert!(!Created.can_transition_to(Running));
        assert!(!Created.can_transition_to(Success));
        assert!(!Success.can_transition_to(Running));
        assert!(!Reported.can_transition_to(Success));
        assert!(!Canceled.can_transition_to(Queued));
        assert!(!Planning.can_transition_to(Running));
    }

    #[test]
    fn self_loops_are_idempotent() {
        for state in [
            RunState::Created,
            RunState::Running,
            RunState::Success,
            RunState::Reported,
        ] {
            assert!(state.can_transition_to(state));
        }
    }

    #[test]
    fn terminal_states_block_dispatch() {
        assert!(RunState::Success.blocks_dispatch());
        assert!(RunState::PlanFailed.blocks_dispatch());
        assert!(RunState::CancelRequested.blocks_dispatch());
        assert!(!RunState::Running.blocks_dispatch());
        assert!(!RunState::Queued.blocks_dispatch());
    }

    #[test]
    fn ref_field_serializes_as_ref() {
        let run = Run::builder()
            .repo_id("acme/widgets")
            .git_ref("refs/heads/main")
            .commit_sha("deadbeef")
            .build();
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["ref"], "refs/heads/main");
        assert!(json.get("git_ref").is_none());
    }
}
