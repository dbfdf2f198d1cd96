//! Lease-fenced runner protocol: grant, acknowledge, heartbeat, complete.

mod common;

use common::*;
use delta_core::common::error::{CoreError, StaleLeaseReason};
use delta_core::domains::jobs::models::{Job, JobAttempt, JobState, Lease, LeaseState};
use delta_core::domains::runs::models::{Run, RunState};
use delta_core::protocol::CompletionStatus;
use sqlx::PgPool;
use test_context::test_context;

async fn lease_by_id(pool: &PgPool, lease_id: &str) -> Lease {
    sqlx::query_as::<_, Lease>(
        "SELECT id, job_attempt_id, runner_id, state, ttl_seconds, heartbeat_interval_seconds, \
         granted_at, acknowledged_at, last_heartbeat_at, expires_at, completed_at \
         FROM leases WHERE id = $1",
    )
    .bind(lease_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[test_context(TestHarness)]
#[tokio::test]
async fn happy_path_runs_to_success_and_reported(ctx: &TestHarness) {
    let bed = ctx.bed_with_plan(single_job_plan());
    let run = bed
        .orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Queued);

    // Dequeue + grant.
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();
    assert_eq!(grant.run_id, run.id);
    assert!(grant.lease_id.starts_with("ls_"));
    assert!(grant.lease_ttl_seconds > grant.heartbeat_interval_seconds);
    assert_eq!(grant.job_spec.steps, vec!["echo build".to_string()]);

    let run = Run::find_by_id(run.id, &ctx.db_pool).await.unwrap();
    assert_eq!(run.state, RunState::Running);

    // Queue is drained: nothing else to grant.
    assert!(bed.orchestrator.grant_next_lease().await.unwrap().is_none());

    // Ack activates the lease and starts the attempt.
    bed.orchestrator.ack_lease(&ack_msg(&grant.lease_id)).await.unwrap();
    let lease = lease_by_id(&ctx.db_pool, &grant.lease_id).await;
    assert_eq!(lease.state, LeaseState::Active);
    assert_eq!(lease.runner_id.as_deref(), Some(RUNNER));

    // Heartbeat extends and reports no cancel.
    let ack = bed
        .orchestrator
        .heartbeat(&heartbeat_msg(&grant.lease_id))
        .await
        .unwrap();
    assert!(ack.extend_lease);
    assert!(!ack.cancel_requested);

    let attempt = JobAttempt::find_by_id(lease.job_attempt_id, &ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(attempt.state, JobState::Running);

    // Complete succeeds the attempt, job, and run.
    bed.orchestrator
        .complete(&complete_msg(&grant.lease_id, CompletionStatus::Succeeded, 0, "ok"))
        .await
        .unwrap();

    let attempt = JobAttempt::find_by_id(lease.job_attempt_id, &ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(attempt.state, JobState::Succeeded);
    assert_eq!(attempt.exit_code, Some(0));

    let job = Job::find_by_id(grant.job_id, &ctx.db_pool).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);

    // Run was finalized SUCCESS, then reported.
    let run = Run::find_by_id(run.id, &ctx.db_pool).await.unwrap();
    assert_eq!(run.state, RunState::Reported);
    let reports = bed.reporter.reports.lock().unwrap().clone();
    assert_eq!(reports, vec![(run.id, "success".to_string())]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unknown_lease_is_rejected(ctx: &TestHarness) {
    let bed = ctx.bed_with_plan(single_job_plan());

    let err = bed
        .orchestrator
        .complete(&complete_msg("ls_who_dis", CompletionStatus::Succeeded, 0, "ok"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::StaleLease {
            reason: StaleLeaseReason::UnknownLease,
            ..
        }
    ));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn complete_without_ack_is_invalid(ctx: &TestHarness) {
    let bed = ctx.bed_with_plan(single_job_plan());
    bed.orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();

    let err = bed
        .orchestrator
        .complete(&complete_msg(&grant.lease_id, CompletionStatus::Succeeded, 0, "ok"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn complete_is_fenced_after_completion(ctx: &TestHarness) {
    let bed = ctx.bed_with_plan(single_job_plan());
    bed.orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();
    bed.orchestrator.ack_lease(&ack_msg(&grant.lease_id)).await.unwrap();
    bed.orchestrator
        .complete(&complete_msg(&grant.lease_id, CompletionStatus::Succeeded, 0, "ok"))
        .await
        .unwrap();

    // Re-delivered Complete: the lease is settled, authority is gone.
    let err = bed
        .orchestrator
        .complete(&complete_msg(&grant.lease_id, CompletionStatus::Failed, 1, "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StaleLease { .. }));

    // And the settled attempt kept its original outcome.
    let lease = lease_by_id(&ctx.db_pool, &grant.lease_id).await;
    let attempt = JobAttempt::find_by_id(lease.job_attempt_id, &ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(attempt.state, JobState::Succeeded);
    assert_eq!(attempt.exit_code, Some(0));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn heartbeat_after_completion_is_stale(ctx: &TestHarness) {
    let bed = ctx.bed_with_plan(single_job_plan());
    bed.orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();
    bed.orchestrator.ack_lease(&ack_msg(&grant.lease_id)).await.unwrap();
    bed.orchestrator
        .complete(&complete_msg(&grant.lease_id, CompletionStatus::Succeeded, 0, "ok"))
        .await
        .unwrap();

    let err = bed
        .orchestrator
        .heartbeat(&heartbeat_msg(&grant.lease_id))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StaleLease { .. }));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn duplicate_ack_is_idempotent(ctx: &TestHarness) {
    let bed = ctx.bed_with_plan(single_job_plan());
    bed.orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();

    bed.orchestrator.ack_lease(&ack_msg(&grant.lease_id)).await.unwrap();
    bed.orchestrator.ack_lease(&ack_msg(&grant.lease_id)).await.unwrap();

    let lease = lease_by_id(&ctx.db_pool, &grant.lease_id).await;
    assert_eq!(lease.state, LeaseState::Active);
}
