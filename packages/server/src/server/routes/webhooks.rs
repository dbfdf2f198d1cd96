//! Webhook ingress.
//!
//! Signature verification is delegated to the configured verifier (an
//! external collaborator). Payloads are normalized to `{repo_id, ref,
//! commit_sha, event_type, pr_number?}` and deduplicated through the
//! trigger table, so redelivered events return the same run.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::server::app::AppState;
use crate::server::error::ApiError;

/// Accepted webhook shapes. GitHub-style push and pull_request payloads are
/// recognized; anything else may post the pre-normalized form directly.
#[derive(Debug, Deserialize)]
struct WebhookBody {
    // GitHub-style fields
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    after: Option<String>,
    repository: Option<RepositoryBody>,
    pull_request: Option<PullRequestBody>,
    number: Option<i64>,

    // Pre-normalized fields
    repo_id: Option<String>,
    commit_sha: Option<String>,
    event_type: Option<String>,
    pr_number: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RepositoryBody {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestBody {
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    sha: String,
}

#[derive(Debug)]
struct NormalizedEvent {
    repo_id: String,
    git_ref: String,
    commit_sha: String,
    event_type: String,
    pr_number: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub run_id: Uuid,
    pub created: bool,
}

fn normalize(body: &WebhookBody, event_header: Option<&str>) -> Result<NormalizedEvent, ApiError> {
    // Pre-normalized form wins when complete.
    if let (Some(repo_id), Some(commit_sha)) = (&body.repo_id, &body.commit_sha) {
        return Ok(NormalizedEvent {
            repo_id: repo_id.clone(),
            git_ref: body.git_ref.clone().unwrap_or_else(|| "refs/heads/main".to_string()),
            commit_sha: commit_sha.clone(),
            event_type: body
                .event_type
                .clone()
                .or_else(|| event_header.map(str::to_string))
                .unwrap_or_else(|| "push".to_string()),
            pr_number: body.pr_number,
        });
    }

    let repo_id = body
        .repository
        .as_ref()
        .map(|r| r.full_name.clone())
        .ok_or_else(|| ApiError::bad_request("missing repository"))?;

    if let Some(pr) = &body.pull_request {
        let pr_number = body
            .number
            .ok_or_else(|| ApiError::bad_request("missing pull request number"))?;
        return Ok(NormalizedEvent {
            repo_id,
            git_ref: format!("refs/pull/{pr_number}/head"),
            commit_sha: pr.head.sha.clone(),
            event_type: event_header.unwrap_or("pull_request").to_string(),
            pr_number: Some(pr_number),
        });
    }

    let commit_sha = body
        .after
        .clone()
        .ok_or_else(|| ApiError::bad_request("missing commit sha"))?;
    let git_ref = body
        .git_ref
        .clone()
        .ok_or_else(|| ApiError::bad_request("missing ref"))?;

    Ok(NormalizedEvent {
        repo_id,
        git_ref,
        commit_sha,
        event_type: event_header.unwrap_or("push").to_string(),
        pr_number: None,
    })
}

pub async fn webhook_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok());
    state
        .kernel
        .webhook_verifier
        .verify(&provider, &body, signature)?;

    let parsed: WebhookBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("malformed webhook payload: {e}")))?;
    let event_header = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok());
    let event = normalize(&parsed, event_header)?;

    let outcome = state
        .orchestrator
        .create_run_from_trigger(
            &provider,
            &event.event_type,
            &event.repo_id,
            &event.git_ref,
            &event.commit_sha,
            event.pr_number,
        )
        .await?;

    let created = outcome.is_created();
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(WebhookResponse {
            run_id: outcome.run().id,
            created,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_github_push_payload() {
        let body: WebhookBody = serde_json::from_value(serde_json::json!({
            "ref": "refs/heads/main",
            "after": "deadbeef",
            "repository": {"full_name": "acme/widgets"},
        }))
        .unwrap();
        let event = normalize(&body, Some("push")).unwrap();
        assert_eq!(event.repo_id, "acme/widgets");
        assert_eq!(event.git_ref, "refs/heads/main");
        assert_eq!(event.commit_sha, "deadbeef");
        assert_eq!(event.event_type, "push");
        assert!(event.pr_number.is_none());
    }

    #[test]
    fn normalizes_github_pull_request_payload() {
        let body: WebhookBody = serde_json::from_value(serde_json::json!({
            "number": 7,
            "repository": {"full_name": "acme/widgets"},
            "pull_request": {"head": {"sha": "cafef00d", "ref": "feature"}},
        }))
        .unwrap();
        let event = normalize(&body, Some("pull_request")).unwrap();
        assert_eq!(event.git_ref, "refs/pull/7/head");
        assert_eq!(event.commit_sha, "cafef00d");
        assert_eq!(event.pr_number, Some(7));
    }

    #[test]
    fn accepts_pre_normalized_payload() {
        let body: WebhookBody = serde_json::from_value(serde_json::json!({
            "repo_id": "acme/widgets",
            "ref": "refs/heads/dev",
            "commit_sha": "0123abcd",
            "event_type": "push",
        }))
        .unwrap();
        let event = normalize(&body, None).unwrap();
        assert_eq!(event.repo_id, "acme/widgets");
        assert_eq!(event.git_ref, "refs/heads/dev");
    }

    #[test]
    fn rejects_payload_without_repository() {
        let body: WebhookBody = serde_json::from_value(serde_json::json!({
            "after": "deadbeef",
        }))
        .unwrap();
        assert!(normalize(&body, None).is_err());
    }
}
