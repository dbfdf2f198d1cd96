//! Lease expiry and recovery: a dead runner's work goes back to the queue,
//! and the dead runner's lease fences out forever.

mod common;

use chrono::Utc;
use common::*;
use delta_core::common::error::CoreError;
use delta_core::domains::jobs::models::{JobAttempt, JobState};
use delta_core::domains::jobs::store::{self, ExpireOutcome};
use delta_core::domains::runs::models::{Run, RunState};
use delta_core::protocol::CompletionStatus;
use sqlx::PgPool;
use test_context::test_context;

/// Force a lease's expiry into the past, simulating a stopped heartbeat.
async fn age_lease(pool: &PgPool, lease_id: &str) {
    sqlx::query("UPDATE leases SET expires_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(lease_id)
        .execute(pool)
        .await
        .unwrap();
}

#[test_context(TestHarness)]
#[tokio::test]
async fn expired_lease_requeues_attempt_and_fences_old_runner(ctx: &TestHarness) {
    let bed = ctx.bed_with_plan(single_job_plan());
    let run = bed
        .orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();

    let first_grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();
    bed.orchestrator
        .ack_lease(&ack_msg(&first_grant.lease_id))
        .await
        .unwrap();

    // Runner stops heartbeating; ttl elapses.
    age_lease(&ctx.db_pool, &first_grant.lease_id).await;

    let now = Utc::now();
    let due = store::find_expirable_lease_ids(&ctx.db_pool, now, 25).await.unwrap();
    assert_eq!(due, vec![first_grant.lease_id.clone()]);
    let outcome = store::expire_lease(&ctx.db_pool, &first_grant.lease_id, now)
        .await
        .unwrap();
    assert_eq!(outcome, ExpireOutcome::Requeued);

    // The next dequeue grants a fresh lease for the same attempt.
    let second_grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();
    assert_eq!(second_grant.job_id, first_grant.job_id);
    assert_ne!(second_grant.lease_id, first_grant.lease_id);

    bed.orchestrator
        .ack_lease(&ack_msg(&second_grant.lease_id))
        .await
        .unwrap();
    bed.orchestrator
        .complete(&complete_msg(&second_grant.lease_id, CompletionStatus::Succeeded, 0, "ok"))
        .await
        .unwrap();

    // Completion under the old lease returns StaleLease and changes nothing.
    let err = bed
        .orchestrator
        .complete(&complete_msg(&first_grant.lease_id, CompletionStatus::Failed, 1, "zombie"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StaleLease { .. }));

    let run = Run::find_by_id(run.id, &ctx.db_pool).await.unwrap();
    assert_eq!(run.state, RunState::Reported);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn healthy_lease_is_never_demoted(ctx: &TestHarness) {
    let bed = ctx.bed_with_plan(single_job_plan());
    bed.orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();
    bed.orchestrator.ack_lease(&ack_msg(&grant.lease_id)).await.unwrap();

    // Sweep with the lease still healthy: nothing is due.
    let due = store::find_expirable_lease_ids(&ctx.db_pool, Utc::now(), 25)
        .await
        .unwrap();
    assert!(due.is_empty());

    // Even a direct expire call re-checks under lock and skips.
    let outcome = store::expire_lease(&ctx.db_pool, &grant.lease_id, Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, ExpireOutcome::Skipped);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn heartbeat_pushes_expiry_forward(ctx: &TestHarness) {
    let bed = ctx.bed_with_plan(single_job_plan());
    bed.orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();
    bed.orchestrator.ack_lease(&ack_msg(&grant.lease_id)).await.unwrap();

    let before = sqlx::query_scalar::<_, chrono::DateTime<Utc>>(
        "SELECT expires_at FROM leases WHERE id = $1",
    )
    .bind(&grant.lease_id)
    .fetch_one(&ctx.db_pool)
    .await
    .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    bed.orchestrator
        .heartbeat(&heartbeat_msg(&grant.lease_id))
        .await
        .unwrap();

    let after = sqlx::query_scalar::<_, chrono::DateTime<Utc>>(
        "SELECT expires_at FROM leases WHERE id = $1",
    )
    .bind(&grant.lease_id)
    .fetch_one(&ctx.db_pool)
    .await
    .unwrap();

    assert!(after > before);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn requeued_attempt_keeps_its_attempt_number(ctx: &TestHarness) {
    let bed = ctx.bed_with_plan(single_job_plan());
    bed.orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();
    bed.orchestrator.ack_lease(&ack_msg(&grant.lease_id)).await.unwrap();
    age_lease(&ctx.db_pool, &grant.lease_id).await;

    store::expire_lease(&ctx.db_pool, &grant.lease_id, Utc::now())
        .await
        .unwrap();

    // Lease expiry requeues the same attempt; it is not a retry.
    let attempts = JobAttempt::find_by_job(grant.job_id, &ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].state, JobState::Queued);
    assert!(attempts[0].lease_id.is_none());
}
