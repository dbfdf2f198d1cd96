//! Run API: create, inspect, cancel, rerun.
//!
//! The read model aggregates jobs, attempts, artifacts, failure
//! explanations, and plan metadata. Lease ids never appear in responses;
//! artifact URIs are returned verbatim and sanitized by consumers.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::jobs::models::{
    Artifact, FailureExplanation, Job, JobAttempt, JobState,
};
use crate::domains::runs::models::{Run, RunPlan, SkippedJob};
use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRunRequest {
    pub repo_id: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub commit_sha: String,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run: Run,
}

#[derive(Debug, Serialize)]
pub struct RerunResponse {
    pub run: Run,
    pub created: bool,
}

/// Attempt view without the lease id.
#[derive(Debug, Serialize)]
pub struct AttemptView {
    pub id: Uuid,
    pub attempt_number: i32,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub summary: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobAttempt> for AttemptView {
    fn from(a: JobAttempt) -> Self {
        Self {
            id: a.id,
            attempt_number: a.attempt_number,
            state: a.state,
            exit_code: a.exit_code,
            summary: a.summary,
            started_at: a.started_at,
            completed_at: a.completed_at,
            created_at: a.created_at,
            updated_at: a.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    pub job: Job,
    pub attempts: Vec<AttemptView>,
    pub artifacts: Vec<Artifact>,
    pub failure_explanations: Vec<FailureExplanation>,
}

#[derive(Debug, Serialize)]
pub struct PlanDetail {
    pub recipe_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe_version: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub explain: String,
    pub skipped_jobs: Vec<SkippedJob>,
}

impl From<RunPlan> for PlanDetail {
    fn from(plan: RunPlan) -> Self {
        let skipped = plan.skipped();
        Self {
            recipe_source: plan.recipe_source,
            recipe_id: plan.recipe_id,
            recipe_version: plan.recipe_version,
            fingerprint: plan.fingerprint,
            explain: plan.explanation,
            skipped_jobs: skipped,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunDetail {
    pub run: Run,
    pub jobs: Vec<JobDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanDetail>,
}

pub async fn create_run_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    let run = state
        .orchestrator
        .create_run(&body.repo_id, &body.git_ref, &body.commit_sha)
        .await?;
    Ok((StatusCode::CREATED, Json(RunResponse { run })))
}

pub async fn get_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunDetail>, ApiError> {
    let pool = &state.kernel.db_pool;
    let run = Run::find_by_id(run_id, pool)
        .await
        .map_err(|_| ApiError::not_found(format!("run not found: {run_id}")))?;

    let mut jobs = Vec::new();
    for job in Job::find_by_run(run_id, pool).await.map_err(internal)? {
        let attempts = JobAttempt::find_by_job(job.id, pool).await.map_err(internal)?;

        let mut artifacts = Vec::new();
        let mut failure_explanations = Vec::new();
        for attempt in &attempts {
            artifacts.extend(
                Artifact::find_by_attempt(attempt.id, pool)
                    .await
                    .map_err(internal)?,
            );
            if let Some(explanation) = FailureExplanation::find_by_attempt(attempt.id, pool)
                .await
                .map_err(internal)?
            {
                failure_explanations.push(explanation);
            }
        }

        jobs.push(JobDetail {
            job,
            attempts: attempts.into_iter().map(AttemptView::from).collect(),
            artifacts,
            failure_explanations,
        });
    }

    let plan = RunPlan::find_by_run(run_id, pool)
        .await
        .map_err(internal)?
        .map(PlanDetail::from);

    Ok(Json(RunDetail { run, jobs, plan }))
}

pub async fn cancel_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state.orchestrator.cancel_run(run_id).await?;
    Ok(Json(RunResponse { run }))
}

pub async fn rerun_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<RerunResponse>), ApiError> {
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("Idempotency-Key header is required"))?;

    let outcome = state.orchestrator.rerun_run(run_id, key).await?;
    let created = outcome.is_created();
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(RerunResponse {
            run: outcome.run().clone(),
            created,
        }),
    ))
}

fn internal(e: anyhow::Error) -> ApiError {
    crate::common::error::CoreError::Internal(e).into()
}
