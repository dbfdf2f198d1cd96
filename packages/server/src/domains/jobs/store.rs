//! Transactional state-store operations.
//!
//! Every compound operation here runs in a single transaction: lock rows,
//! validate each transition against the state-machine tables, update,
//! commit. An invalid transition aborts the transaction with
//! `CoreError::Transition` and mutates nothing.
//!
//! Row locks are always acquired in the same order -- run, then lease,
//! then job, then attempt -- so concurrent compound operations cannot
//! deadlock. Ids needed to follow that order (an attempt's job, a job's
//! latest attempt) are read without locks first; they are immutable or
//! re-validated once the lock is held.
//!
//! Lease-fenced operations (`acknowledge_lease`, `heartbeat_lease`,
//! `complete_attempt`, `acknowledge_cancel`) first lock the lease row and
//! reject anything that is not a live, unexpired lease with
//! `CoreError::StaleLease`.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::warn;
use uuid::Uuid;

use super::models::{Job, JobAttempt, JobState, Lease, LeaseState};
use super::queue;
use crate::common::error::{CoreError, StaleLeaseReason, TransitionError};
use crate::domains::runs::models::{Run, RunState};

const RUN_COLUMNS: &str = "id, repo_id, git_ref, commit_sha, state, started_at, created_at, updated_at";
const JOB_COLUMNS: &str = "id, run_id, name, required, state, attempt_count, reason, created_at, updated_at";
const ATTEMPT_COLUMNS: &str = "id, job_id, attempt_number, state, lease_id, exit_code, summary, \
                               started_at, completed_at, created_at, updated_at";
const LEASE_COLUMNS: &str = "id, job_attempt_id, runner_id, state, ttl_seconds, \
                             heartbeat_interval_seconds, granted_at, acknowledged_at, \
                             last_heartbeat_at, expires_at, completed_at";

// ============================================================================
// Row locking
// ============================================================================

pub(crate) async fn lock_run(conn: &mut PgConnection, id: Uuid) -> Result<Run, CoreError> {
    sqlx::query_as::<_, Run>(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1 FOR UPDATE"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })
}

pub(crate) async fn lock_job(conn: &mut PgConnection, id: Uuid) -> Result<Job, CoreError> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CoreError::NotFound {
            entity: "job",
            id: id.to_string(),
        })
}

pub(crate) async fn lock_attempt(conn: &mut PgConnection, id: Uuid) -> Result<JobAttempt, CoreError> {
    sqlx::query_as::<_, JobAttempt>(&format!(
        "SELECT {ATTEMPT_COLUMNS} FROM job_attempts WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| CoreError::NotFound {
        entity: "job_attempt",
        id: id.to_string(),
    })
}

async fn lock_lease(conn: &mut PgConnection, id: &str) -> Result<Option<Lease>, CoreError> {
    let lease = sqlx::query_as::<_, Lease>(&format!(
        "SELECT {LEASE_COLUMNS} FROM leases WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(lease)
}

/// The job an attempt belongs to. Immutable, so no lock is needed; used to
/// acquire locks in job-before-attempt order.
async fn job_id_of_attempt(conn: &mut PgConnection, attempt_id: Uuid) -> Result<Uuid, CoreError> {
    sqlx::query_scalar::<_, Uuid>("SELECT job_id FROM job_attempts WHERE id = $1")
        .bind(attempt_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CoreError::NotFound {
            entity: "job_attempt",
            id: attempt_id.to_string(),
        })
}

/// A job's latest attempt id. Unlocked read; the caller locks and
/// re-validates afterwards.
async fn latest_attempt_id(conn: &mut PgConnection, job_id: Uuid) -> Result<Option<Uuid>, CoreError> {
    let id = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM job_attempts WHERE job_id = $1 ORDER BY attempt_number DESC LIMIT 1",
    )
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(id)
}

// ============================================================================
// Validated single-entity transitions
// ============================================================================

pub(crate) async fn set_run_state(
    conn: &mut PgConnection,
    run: &Run,
    next: RunState,
) -> Result<Run, CoreError> {
    if !run.state.can_transition_to(next) {
        return Err(CoreError::Transition(TransitionError {
            entity: "run",
            id: run.id.to_string(),
            from: run.state.as_str().to_string(),
            to: next.as_str().to_string(),
        }));
    }
    if run.state == next {
        return Ok(run.clone());
    }

    // The first move into RUNNING stamps started_at for the timeout sweep.
    let run = sqlx::query_as::<_, Run>(&format!(
        r#"
        UPDATE runs
        SET state = $1,
            started_at = CASE WHEN $1 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
            updated_at = NOW()
        WHERE id = $2
        RETURNING {RUN_COLUMNS}
        "#
    ))
    .bind(next)
    .bind(run.id)
    .fetch_one(conn)
    .await?;

    Ok(run)
}

pub(crate) async fn set_job_state(
    conn: &mut PgConnection,
    job: &Job,
    next: JobState,
) -> Result<Job, CoreError> {
    if !job.state.can_transition_to(next) {
        return Err(CoreError::Transition(TransitionError {
            entity: "job",
            id: job.id.to_string(),
            from: job.state.as_str().to_string(),
            to: next.as_str().to_string(),
        }));
    }
    if job.state == next {
        return Ok(job.clone());
    }

    let job = sqlx::query_as::<_, Job>(&format!(
        "UPDATE jobs SET state = $1, updated_at = NOW() WHERE id = $2 RETURNING {JOB_COLUMNS}"
    ))
    .bind(next)
    .bind(job.id)
    .fetch_one(conn)
    .await?;

    Ok(job)
}

pub(crate) async fn set_attempt_state(
    conn: &mut PgConnection,
    attempt: &JobAttempt,
    next: JobState,
) -> Result<JobAttempt, CoreError> {
    if !attempt.state.can_transition_to(next) {
        return Err(CoreError::Transition(TransitionError {
            entity: "job_attempt",
            id: attempt.id.to_string(),
            from: attempt.state.as_str().to_string(),
            to: next.as_str().to_string(),
        }));
    }
    if attempt.state == next {
        return Ok(attempt.clone());
    }

    let attempt = sqlx::query_as::<_, JobAttempt>(&format!(
        r#"
        UPDATE job_attempts
        SET state = $1,
            started_at = CASE WHEN $1 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
            updated_at = NOW()
        WHERE id = $2
        RETURNING {ATTEMPT_COLUMNS}
        "#
    ))
    .bind(next)
    .bind(attempt.id)
    .fetch_one(conn)
    .await?;

    Ok(attempt)
}

async fn set_lease_state(
    conn: &mut PgConnection,
    lease: &Lease,
    next: LeaseState,
) -> Result<Lease, CoreError> {
    if !lease.state.can_transition_to(next) {
        return Err(CoreError::Transition(TransitionError {
            entity: "lease",
            id: lease.id.clone(),
            from: lease.state.as_str().to_string(),
            to: next.as_str().to_string(),
        }));
    }
    if lease.state == next {
        return Ok(lease.clone());
    }

    let lease = sqlx::query_as::<_, Lease>(&format!(
        r#"
        UPDATE leases
        SET state = $1,
            completed_at = CASE WHEN $1 IN ('completed', 'canceled') THEN NOW() ELSE completed_at END
        WHERE id = $2
        RETURNING {LEASE_COLUMNS}
        "#
    ))
    .bind(next)
    .bind(&lease.id)
    .fetch_one(conn)
    .await?;

    Ok(lease)
}

// ============================================================================
// Pool-level single transitions
// ============================================================================

pub async fn transition_run(pool: &PgPool, run_id: Uuid, next: RunState) -> Result<Run, CoreError> {
    let mut tx = pool.begin().await?;
    let run = lock_run(&mut tx, run_id).await?;
    let run = set_run_state(&mut tx, &run, next).await?;
    tx.commit().await?;
    Ok(run)
}

pub async fn transition_job(pool: &PgPool, job_id: Uuid, next: JobState) -> Result<Job, CoreError> {
    let mut tx = pool.begin().await?;
    let job = lock_job(&mut tx, job_id).await?;
    let job = set_job_state(&mut tx, &job, next).await?;
    tx.commit().await?;
    Ok(job)
}

pub async fn transition_attempt(
    pool: &PgPool,
    attempt_id: Uuid,
    next: JobState,
) -> Result<JobAttempt, CoreError> {
    let mut tx = pool.begin().await?;
    let attempt = lock_attempt(&mut tx, attempt_id).await?;
    let attempt = set_attempt_state(&mut tx, &attempt, next).await?;
    tx.commit().await?;
    Ok(attempt)
}

// ============================================================================
// Lease lifecycle
// ============================================================================

/// Result of a successful lease grant.
#[derive(Debug, Clone)]
pub struct GrantedLease {
    pub lease: Lease,
    pub attempt: JobAttempt,
    pub job: Job,
    pub run: Run,
}

fn stale(lease_id: &str, reason: StaleLeaseReason) -> CoreError {
    CoreError::StaleLease {
        lease_id: lease_id.to_string(),
        reason,
    }
}

/// Map a non-live lease state to the reason a runner sees. A completed or
/// canceled lease no longer carries authority, which a runner handles the
/// same way as expiry: stop and discard the work.
fn stale_reason_for(state: LeaseState) -> StaleLeaseReason {
    match state {
        LeaseState::Revoked => StaleLeaseReason::LeaseRevoked,
        _ => StaleLeaseReason::LeaseExpired,
    }
}

/// Grant a lease for a queued attempt: insert the lease row, move attempt
/// and job to LEASED, and ack the queue row, all in one transaction. The
/// partial unique index on live leases backstops concurrent grants.
pub async fn grant_lease(
    pool: &PgPool,
    attempt_id: Uuid,
    lease_id: &str,
    ttl_seconds: i64,
    heartbeat_interval_seconds: i64,
) -> Result<GrantedLease, CoreError> {
    if ttl_seconds <= heartbeat_interval_seconds {
        return Err(CoreError::Validation(format!(
            "lease ttl ({ttl_seconds}s) must exceed heartbeat interval ({heartbeat_interval_seconds}s)"
        )));
    }

    let mut tx = pool.begin().await?;

    // Resolve ids first, then lock in run -> job -> attempt order.
    let ids = sqlx::query_as::<_, (Uuid, Uuid)>(
        r#"
        SELECT j.run_id, j.id
        FROM job_attempts a
        JOIN jobs j ON j.id = a.job_id
        WHERE a.id = $1
        "#,
    )
    .bind(attempt_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| CoreError::NotFound {
        entity: "job_attempt",
        id: attempt_id.to_string(),
    })?;

    let run = lock_run(&mut tx, ids.0).await?;
    let job = lock_job(&mut tx, ids.1).await?;
    let attempt = lock_attempt(&mut tx, attempt_id).await?;

    if run.state.blocks_dispatch() {
        return Err(CoreError::Transition(TransitionError {
            entity: "run",
            id: run.id.to_string(),
            from: run.state.as_str().to_string(),
            to: "leased".to_string(),
        }));
    }

    // The self-loop would wave a duplicate delivery through, so the QUEUED
    // requirement is explicit; the partial unique index is the backstop.
    if attempt.state != JobState::Queued {
        return Err(CoreError::Transition(TransitionError {
            entity: "job_attempt",
            id: attempt.id.to_string(),
            from: attempt.state.as_str().to_string(),
            to: JobState::Leased.as_str().to_string(),
        }));
    }

    let attempt = set_attempt_state(&mut tx, &attempt, JobState::Leased).await?;
    let job = set_job_state(&mut tx, &job, JobState::Leased).await?;

    let lease = sqlx::query_as::<_, Lease>(&format!(
        r#"
        INSERT INTO leases (id, job_attempt_id, state, ttl_seconds, heartbeat_interval_seconds,
                            granted_at, expires_at)
        VALUES ($1, $2, 'granted', $3, $4, NOW(), NOW() + ($3::text || ' seconds')::INTERVAL)
        RETURNING {LEASE_COLUMNS}
        "#
    ))
    .bind(lease_id)
    .bind(attempt_id)
    .bind(ttl_seconds)
    .bind(heartbeat_interval_seconds)
    .fetch_one(&mut *tx)
    .await?;

    let attempt = sqlx::query_as::<_, JobAttempt>(&format!(
        "UPDATE job_attempts SET lease_id = $1, updated_at = NOW() WHERE id = $2 RETURNING {ATTEMPT_COLUMNS}"
    ))
    .bind(lease_id)
    .bind(attempt_id)
    .fetch_one(&mut *tx)
    .await?;

    queue::ack(&mut tx, attempt_id).await?;

    tx.commit().await?;

    Ok(GrantedLease {
        lease,
        attempt,
        job,
        run,
    })
}

/// Lock and return a live, unexpired ACTIVE lease for fencing, or fail
/// with StaleLease.
async fn require_active_lease(
    conn: &mut PgConnection,
    lease_id: &str,
    now: DateTime<Utc>,
) -> Result<Lease, CoreError> {
    let lease = lock_lease(conn, lease_id)
        .await?
        .ok_or_else(|| stale(lease_id, StaleLeaseReason::UnknownLease))?;

    match lease.state {
        LeaseState::Active => {}
        LeaseState::Granted => {
            return Err(CoreError::Validation(format!(
                "lease {lease_id} has not been acknowledged"
            )));
        }
        other => return Err(stale(lease_id, stale_reason_for(other))),
    }
    if lease.is_expired(now) {
        return Err(stale(lease_id, StaleLeaseReason::LeaseExpired));
    }

    Ok(lease)
}

/// Acknowledge a granted lease: activate it, record the runner, extend the
/// expiry, and move attempt and job to STARTING.
pub async fn acknowledge_lease(
    pool: &PgPool,
    lease_id: &str,
    runner_id: &str,
) -> Result<Lease, CoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let lease = lock_lease(&mut tx, lease_id)
        .await?
        .ok_or_else(|| stale(lease_id, StaleLeaseReason::UnknownLease))?;

    if !lease.state.is_live() {
        return Err(stale(lease_id, stale_reason_for(lease.state)));
    }
    if lease.is_expired(now) {
        return Err(stale(lease_id, StaleLeaseReason::LeaseExpired));
    }

    let lease = sqlx::query_as::<_, Lease>(&format!(
        r#"
        UPDATE leases
        SET state = 'active',
            runner_id = $1,
            acknowledged_at = COALESCE(acknowledged_at, NOW()),
            expires_at = NOW() + (ttl_seconds::text || ' seconds')::INTERVAL
        WHERE id = $2
        RETURNING {LEASE_COLUMNS}
        "#
    ))
    .bind(runner_id)
    .bind(lease_id)
    .fetch_one(&mut *tx)
    .await?;

    let job_id = job_id_of_attempt(&mut tx, lease.job_attempt_id).await?;
    let job = lock_job(&mut tx, job_id).await?;
    let attempt = lock_attempt(&mut tx, lease.job_attempt_id).await?;

    set_job_state(&mut tx, &job, JobState::Starting).await?;
    set_attempt_state(&mut tx, &attempt, JobState::Starting).await?;

    tx.commit().await?;

    Ok(lease)
}

/// Outcome of a heartbeat, including whether the runner should wind down.
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub lease: Lease,
    pub cancel_requested: bool,
}

/// Process a heartbeat: extend the lease from the heartbeat timestamp and
/// report back whether cancellation has been requested for the job or run.
/// The first heartbeat after acknowledgment advances STARTING to RUNNING.
pub async fn heartbeat_lease(
    pool: &PgPool,
    lease_id: &str,
    _runner_id: &str,
) -> Result<HeartbeatOutcome, CoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let lease = require_active_lease(&mut tx, lease_id, now).await?;

    let lease = sqlx::query_as::<_, Lease>(&format!(
        r#"
        UPDATE leases
        SET last_heartbeat_at = $1,
            expires_at = $1 + (ttl_seconds::text || ' seconds')::INTERVAL
        WHERE id = $2
        RETURNING {LEASE_COLUMNS}
        "#
    ))
    .bind(now)
    .bind(lease_id)
    .fetch_one(&mut *tx)
    .await?;

    let job_id = job_id_of_attempt(&mut tx, lease.job_attempt_id).await?;
    let job = lock_job(&mut tx, job_id).await?;
    let attempt = lock_attempt(&mut tx, lease.job_attempt_id).await?;

    let job = if job.state == JobState::Starting {
        set_job_state(&mut tx, &job, JobState::Running).await?
    } else {
        job
    };
    if attempt.state == JobState::Starting {
        set_attempt_state(&mut tx, &attempt, JobState::Running).await?;
    }

    let run_state = sqlx::query_scalar::<_, RunState>("SELECT state FROM runs WHERE id = $1")
        .bind(job.run_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;

    let cancel_requested = job.state == JobState::CancelRequested
        || matches!(run_state, RunState::CancelRequested | RunState::Timeout);

    Ok(HeartbeatOutcome {
        lease,
        cancel_requested,
    })
}

/// Outcome of Complete / CancelAck processing.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub lease: Lease,
    pub attempt: JobAttempt,
    pub job: Job,
    /// True when the attempt finished on the cancel path rather than with a
    /// SUCCEEDED/FAILED verdict.
    pub canceled: bool,
}

/// Finalize an attempt from a runner's Complete message. The attempt walks
/// RUNNING -> UPLOADING -> {SUCCEEDED | FAILED}; a completion racing a
/// cancel request settles the attempt as CANCELED while still recording the
/// runner's facts.
pub async fn complete_attempt(
    pool: &PgPool,
    lease_id: &str,
    _runner_id: &str,
    succeeded: bool,
    exit_code: Option<i32>,
    summary: Option<&str>,
) -> Result<CompletionOutcome, CoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let lease = require_active_lease(&mut tx, lease_id, now).await?;

    let job_id = job_id_of_attempt(&mut tx, lease.job_attempt_id).await?;
    let job = lock_job(&mut tx, job_id).await?;
    let attempt = lock_attempt(&mut tx, lease.job_attempt_id).await?;

    let cancel_pending =
        attempt.state == JobState::CancelRequested || job.state == JobState::CancelRequested;

    let (attempt, job, final_state) = if cancel_pending {
        let job = set_job_state(&mut tx, &job, JobState::CancelRequested).await?;
        let job = set_job_state(&mut tx, &job, JobState::Canceled).await?;
        let attempt = set_attempt_state(&mut tx, &attempt, JobState::CancelRequested).await?;
        let attempt = set_attempt_state(&mut tx, &attempt, JobState::Canceled).await?;
        (attempt, job, JobState::Canceled)
    } else {
        let final_state = if succeeded {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        // A completion may arrive before any heartbeat advanced STARTING.
        let mut job = job;
        if job.state == JobState::Starting {
            job = set_job_state(&mut tx, &job, JobState::Running).await?;
        }
        let job = set_job_state(&mut tx, &job, JobState::Uploading).await?;
        let job = set_job_state(&mut tx, &job, final_state).await?;

        let mut attempt = attempt;
        if attempt.state == JobState::Starting {
            attempt = set_attempt_state(&mut tx, &attempt, JobState::Running).await?;
        }
        let attempt = set_attempt_state(&mut tx, &attempt, JobState::Uploading).await?;
        let attempt = set_attempt_state(&mut tx, &attempt, final_state).await?;
        (attempt, job, final_state)
    };

    let attempt = sqlx::query_as::<_, JobAttempt>(&format!(
        r#"
        UPDATE job_attempts
        SET exit_code = $1, summary = $2, completed_at = NOW(), updated_at = NOW()
        WHERE id = $3
        RETURNING {ATTEMPT_COLUMNS}
        "#
    ))
    .bind(exit_code)
    .bind(summary)
    .bind(attempt.id)
    .fetch_one(&mut *tx)
    .await?;

    let lease = set_lease_state(
        &mut tx,
        &lease,
        if final_state == JobState::Canceled {
            LeaseState::Canceled
        } else {
            LeaseState::Completed
        },
    )
    .await?;

    tx.commit().await?;

    Ok(CompletionOutcome {
        lease,
        attempt,
        job,
        canceled: final_state == JobState::Canceled,
    })
}

/// Finalize an attempt from a runner's CancelAck.
pub async fn acknowledge_cancel(
    pool: &PgPool,
    lease_id: &str,
    _runner_id: &str,
) -> Result<CompletionOutcome, CoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let lease = require_active_lease(&mut tx, lease_id, now).await?;

    let job_id = job_id_of_attempt(&mut tx, lease.job_attempt_id).await?;
    let job = lock_job(&mut tx, job_id).await?;
    let attempt = lock_attempt(&mut tx, lease.job_attempt_id).await?;

    let job = set_job_state(&mut tx, &job, JobState::CancelRequested).await?;
    let job = set_job_state(&mut tx, &job, JobState::Canceled).await?;
    let attempt = set_attempt_state(&mut tx, &attempt, JobState::CancelRequested).await?;
    let attempt = set_attempt_state(&mut tx, &attempt, JobState::Canceled).await?;

    let attempt = sqlx::query_as::<_, JobAttempt>(&format!(
        "UPDATE job_attempts SET completed_at = NOW(), updated_at = NOW() WHERE id = $1 RETURNING {ATTEMPT_COLUMNS}"
    ))
    .bind(attempt.id)
    .fetch_one(&mut *tx)
    .await?;

    let lease = set_lease_state(&mut tx, &lease, LeaseState::Canceled).await?;

    tx.commit().await?;

    Ok(CompletionOutcome {
        lease,
        attempt,
        job,
        canceled: true,
    })
}

// ============================================================================
// Lease expiry sweep
// ============================================================================

/// Live leases whose expiry has passed. Candidates only; each one is
/// re-checked under its own row lock by [`expire_lease`].
pub async fn find_expirable_lease_ids(
    pool: &PgPool,
    now: DateTime<Utc>,
    batch: i64,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        r#"
        SELECT id FROM leases
        WHERE state IN ('granted', 'active') AND expires_at <= $1
        ORDER BY expires_at
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(batch)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// What the expiry sweep did with one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// Lease expired; attempt and job went back to QUEUED.
    Requeued,
    /// Lease expired; the attempt could not validly return to QUEUED.
    ExpiredOnly,
    /// Someone else holds the row or the lease was refreshed meanwhile.
    Skipped,
}

/// Expire one lease if it is still live and due. Uses SKIP LOCKED so sweeps
/// never contend with live runner traffic: a heartbeat holding the row lock
/// wins, and the re-check under lock drops leases it refreshed.
pub async fn expire_lease(
    pool: &PgPool,
    lease_id: &str,
    now: DateTime<Utc>,
) -> Result<ExpireOutcome, CoreError> {
    let mut tx = pool.begin().await?;

    let lease = sqlx::query_as::<_, Lease>(&format!(
        "SELECT {LEASE_COLUMNS} FROM leases WHERE id = $1 FOR UPDATE SKIP LOCKED"
    ))
    .bind(lease_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(lease) = lease else {
        return Ok(ExpireOutcome::Skipped);
    };
    if !lease.state.is_live() || !lease.is_expired(now) {
        return Ok(ExpireOutcome::Skipped);
    }

    let lease = set_lease_state(&mut tx, &lease, LeaseState::Expired).await?;

    let job_id = job_id_of_attempt(&mut tx, lease.job_attempt_id).await?;
    let job = lock_job(&mut tx, job_id).await?;
    let attempt = lock_attempt(&mut tx, lease.job_attempt_id).await?;

    let outcome = if attempt.state.can_transition_to(JobState::Queued)
        && job.state.can_transition_to(JobState::Queued)
    {
        set_job_state(&mut tx, &job, JobState::Queued).await?;
        let attempt = set_attempt_state(&mut tx, &attempt, JobState::Queued).await?;

        sqlx::query("UPDATE job_attempts SET lease_id = NULL, updated_at = NOW() WHERE id = $1")
            .bind(attempt.id)
            .execute(&mut *tx)
            .await?;

        queue::enqueue(&mut tx, attempt.id, now).await?;
        ExpireOutcome::Requeued
    } else {
        // The state machine has no recovery edge here. Expire the lease but
        // leave the attempt where it is; an operator has to decide.
        warn!(
            lease_id = %lease.id,
            attempt_id = %attempt.id,
            job_id = %job.id,
            attempt_state = attempt.state.as_str(),
            job_state = job.state.as_str(),
            "lease expired but attempt is not requeueable; operator attention required"
        );
        ExpireOutcome::ExpiredOnly
    };

    tx.commit().await?;

    Ok(outcome)
}

// ============================================================================
// Queueing and retries
// ============================================================================

/// Move a job (and its latest attempt) into QUEUED and enqueue the attempt.
/// Used at plan time for root jobs and by the dependency gate afterwards.
pub async fn mark_job_queued(pool: &PgPool, job_id: Uuid) -> Result<(Job, JobAttempt), CoreError> {
    let mut tx = pool.begin().await?;

    let job = lock_job(&mut tx, job_id).await?;
    let attempt_id =
        latest_attempt_id(&mut tx, job_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "job_attempt",
                id: format!("latest for job {job_id}"),
            })?;
    let attempt = lock_attempt(&mut tx, attempt_id).await?;

    let job = set_job_state(&mut tx, &job, JobState::Queued).await?;
    let attempt = set_attempt_state(&mut tx, &attempt, JobState::Queued).await?;
    queue::enqueue(&mut tx, attempt.id, Utc::now()).await?;

    tx.commit().await?;

    Ok((job, attempt))
}

/// Create attempt N+1 for a retryable failed job and enqueue it after a
/// backoff delay. The prior attempt remains immutable history.
pub async fn create_retry_attempt(
    pool: &PgPool,
    job_id: Uuid,
    backoff: Duration,
) -> Result<JobAttempt, CoreError> {
    let mut tx = pool.begin().await?;

    let job = lock_job(&mut tx, job_id).await?;
    let job = set_job_state(&mut tx, &job, JobState::Queued).await?;

    let next_number = job.attempt_count + 1;
    let attempt = sqlx::query_as::<_, JobAttempt>(&format!(
        r#"
        INSERT INTO job_attempts (id, job_id, attempt_number, state, created_at, updated_at)
        VALUES ($1, $2, $3, 'queued', NOW(), NOW())
        RETURNING {ATTEMPT_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(job_id)
    .bind(next_number)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE jobs SET attempt_count = $1, updated_at = NOW() WHERE id = $2")
        .bind(next_number)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

    queue::enqueue(&mut tx, attempt.id, Utc::now() + backoff).await?;

    tx.commit().await?;

    Ok(attempt)
}

/// Cancel a job that has not reached a runner: job and latest attempt go
/// straight to CANCELED and any queue row is removed.
pub async fn cancel_job_immediately(pool: &PgPool, job_id: Uuid) -> Result<Job, CoreError> {
    let mut tx = pool.begin().await?;

    let job = lock_job(&mut tx, job_id).await?;
    let job = set_job_state(&mut tx, &job, JobState::Canceled).await?;

    if let Some(attempt_id) = latest_attempt_id(&mut tx, job_id).await? {
        let attempt = lock_attempt(&mut tx, attempt_id).await?;
        let attempt = set_attempt_state(&mut tx, &attempt, JobState::Canceled).await?;
        sqlx::query("UPDATE job_attempts SET completed_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(attempt.id)
            .execute(&mut *tx)
            .await?;
        queue::ack(&mut tx, attempt.id).await?;
    }

    tx.commit().await?;

    Ok(job)
}

/// Ask an executing job to cancel. The runner learns about it on its next
/// heartbeat; the forced-cancel sweep finishes the job if no CancelAck
/// arrives before the deadline.
pub async fn request_job_cancel(pool: &PgPool, job_id: Uuid) -> Result<Job, CoreError> {
    let mut tx = pool.begin().await?;

    let job = lock_job(&mut tx, job_id).await?;
    let job = set_job_state(&mut tx, &job, JobState::CancelRequested).await?;

    if let Some(attempt_id) = latest_attempt_id(&mut tx, job_id).await? {
        let attempt = lock_attempt(&mut tx, attempt_id).await?;
        set_attempt_state(&mut tx, &attempt, JobState::CancelRequested).await?;
    }

    tx.commit().await?;

    Ok(job)
}

/// Force a CANCEL_REQUESTED job to CANCELED after the cancel deadline. Any
/// live lease is revoked so a late CancelAck or Complete fences out.
pub async fn force_cancel_job(pool: &PgPool, job_id: Uuid) -> Result<Job, CoreError> {
    let mut tx = pool.begin().await?;

    // Read the lease id without locks so the lease lock can be taken first,
    // in the global order. States are re-validated under the locks.
    let attempt_ref = sqlx::query_as::<_, (Uuid, Option<String>)>(
        r#"
        SELECT id, lease_id FROM job_attempts
        WHERE job_id = $1
        ORDER BY attempt_number DESC
        LIMIT 1
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?;

    let lease = match &attempt_ref {
        Some((_, Some(lease_id))) => lock_lease(&mut tx, lease_id).await?,
        _ => None,
    };

    let job = lock_job(&mut tx, job_id).await?;
    if job.state != JobState::CancelRequested {
        tx.rollback().await?;
        return Ok(job);
    }
    let job = set_job_state(&mut tx, &job, JobState::Canceled).await?;

    if let Some((attempt_id, _)) = attempt_ref {
        let attempt = lock_attempt(&mut tx, attempt_id).await?;
        let attempt = set_attempt_state(&mut tx, &attempt, JobState::Canceled).await?;
        sqlx::query("UPDATE job_attempts SET completed_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(attempt.id)
            .execute(&mut *tx)
            .await?;
    }

    if let Some(lease) = lease {
        if lease.state.is_live() {
            set_lease_state(&mut tx, &lease, LeaseState::Revoked).await?;
        }
    }

    tx.commit().await?;

    Ok(job)
}
