//! HTTP surface: routing, request decoding, error envelope, and the
//! lease-id redaction rule on the run read model.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use delta_core::protocol::CompletionStatus;
use delta_core::server::{build_app, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use test_context::test_context;
use tower::ServiceExt;

fn app_for(ctx: &TestHarness) -> (axum::Router, common::harness::TestBed) {
    let bed = ctx.bed_with_plan(single_job_plan());
    let app = build_app(AppState::new(bed.kernel.clone(), bed.orchestrator.clone()));
    (app, bed)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[test_context(TestHarness)]
#[tokio::test]
async fn create_and_fetch_run_hides_lease_ids(ctx: &TestHarness) {
    let (app, bed) = app_for(ctx);
    let repo = unique_repo();
    let sha = unique_sha();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/runs",
            json!({"repo_id": repo, "ref": "refs/heads/main", "commit_sha": sha}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let run_id = created["run"]["id"].as_str().unwrap().to_string();

    // Put a lease in play so redaction has something to hide.
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();
    bed.orchestrator.ack_lease(&ack_msg(&grant.lease_id)).await.unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/runs/{run_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = body_json(response).await;

    assert_eq!(detail["run"]["id"], run_id.as_str());
    assert_eq!(detail["plan"]["recipe_source"], "discovery");
    let rendered = detail.to_string();
    assert!(!rendered.contains(&grant.lease_id));
    assert!(!rendered.contains("lease_id"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn healthz_reports_dispatch_state(ctx: &TestHarness) {
    let (app, bed) = app_for(ctx);
    // One freshly planned run: a queued attempt, no lease yet.
    bed.orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["control_plane"]["queued_attempts"], 1);
    assert_eq!(body["control_plane"]["runs_in_flight"], 1);
    assert_eq!(body["control_plane"]["live_leases"], 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unknown_run_returns_error_envelope(ctx: &TestHarness) {
    let (app, _bed) = app_for(ctx);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/runs/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert!(body["error"]["message"].is_string());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn duplicate_webhooks_return_same_run_id(ctx: &TestHarness) {
    let (app, _bed) = app_for(ctx);
    let payload = json!({
        "ref": "refs/heads/main",
        "after": unique_sha(),
        "repository": {"full_name": unique_repo()},
    });

    let first = app
        .clone()
        .oneshot(post_json("/api/v1/webhooks/github", payload.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first_body = body_json(first).await;

    let second = app
        .clone()
        .oneshot(post_json("/api/v1/webhooks/github", payload))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;

    assert_eq!(first_body["run_id"], second_body["run_id"]);
    assert_eq!(first_body["created"], true);
    assert_eq!(second_body["created"], false);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn rerun_requires_idempotency_key_header(ctx: &TestHarness) {
    let (app, bed) = app_for(ctx);
    let run = bed
        .orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/v1/runs/{}/rerun", run.id), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/runs/{}/rerun", run.id))
                .header("Idempotency-Key", "key-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["created"], true);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn stale_lease_maps_to_conflict_with_reason(ctx: &TestHarness) {
    let (app, _bed) = app_for(ctx);

    let response = app
        .oneshot(post_json(
            "/api/v1/internal/complete",
            json!({
                "lease_id": "ls_unknown",
                "runner_id": "runner-1",
                "status": "SUCCEEDED",
                "exit_code": 0,
                "summary": "ok",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "STALE_LEASE");
    assert_eq!(body["error"]["details"]["reason"], "UNKNOWN_LEASE");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unknown_fields_in_protocol_messages_are_rejected(ctx: &TestHarness) {
    let (app, _bed) = app_for(ctx);

    let response = app
        .oneshot(post_json(
            "/api/v1/internal/ack-lease",
            json!({"lease_id": "ls_x", "runner_id": "r", "color": "red"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn cancel_endpoint_is_idempotent(ctx: &TestHarness) {
    let (app, bed) = app_for(ctx);
    let run = bed
        .orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();

    // Keep the job executing so repeated cancels hit a mid-cancel run.
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();
    bed.orchestrator.ack_lease(&ack_msg(&grant.lease_id)).await.unwrap();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json(&format!("/api/v1/runs/{}/cancel", run.id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn internal_complete_drives_the_run_end_to_end(ctx: &TestHarness) {
    let (app, bed) = app_for(ctx);
    bed.orchestrator
        .create_run(&unique_repo(), "refs/heads/main", &unique_sha())
        .await
        .unwrap();
    let grant = bed.orchestrator.grant_next_lease().await.unwrap().unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/internal/ack-lease",
            json!({"lease_id": grant.lease_id, "runner_id": "runner-1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/internal/heartbeat",
            json!({"lease_id": grant.lease_id, "runner_id": "runner-1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let ack = body_json(response).await;
    assert_eq!(ack["extend_lease"], true);
    assert_eq!(ack["cancel_requested"], false);

    let complete = complete_msg(&grant.lease_id, CompletionStatus::Succeeded, 0, "ok");
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/internal/complete",
            serde_json::to_value(&complete).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
