//! Orchestrator service.
//!
//! Owns every run/job/attempt/lease state transition. Entry points are
//! idempotent: duplicate webhook triggers and reruns collapse onto the
//! existing run, duplicate protocol messages are absorbed by the state
//! machines, and finalization recomputes from current rows under the run
//! lock.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Duration;
use sqlx::PgConnection;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::error::CoreError;
use crate::domains::failures::{classify, FailureFacts};
use crate::domains::jobs::models::{
    Artifact, CacheEvent, FailureExplanation, Job, JobAiExplanation, JobAttempt, JobDependency,
    JobSpecRow, JobState,
};
use crate::domains::jobs::{queue, store};
use crate::domains::planner::{Plan, PlanRequest};
use crate::domains::runs::models::{Run, RunPlan, RunRerun, RunState, RunTrigger};
use crate::kernel::ServerKernel;
use crate::protocol::{
    AckLease, CancelAck, Complete, CompletionStatus, Heartbeat, HeartbeatAck, LeaseGranted,
};

/// Result of an idempotent create-style entry point.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Run),
    Existing(Run),
}

impl CreateOutcome {
    pub fn run(&self) -> &Run {
        match self {
            CreateOutcome::Created(run) | CreateOutcome::Existing(run) => run,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

pub struct Orchestrator {
    kernel: Arc<ServerKernel>,
}

impl Orchestrator {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &Arc<ServerKernel> {
        &self.kernel
    }

    fn pool(&self) -> &sqlx::PgPool {
        &self.kernel.db_pool
    }

    // =========================================================================
    // Run creation
    // =========================================================================

    fn validate_create(repo_id: &str, git_ref: &str, commit_sha: &str) -> Result<(), CoreError> {
        if repo_id.trim().is_empty() {
            return Err(CoreError::Validation("repo_id must not be empty".into()));
        }
        if git_ref.trim().is_empty() {
            return Err(CoreError::Validation("ref must not be empty".into()));
        }
        if commit_sha.trim().is_empty() || !commit_sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::Validation(
                "commit_sha must be a hex string".into(),
            ));
        }
        Ok(())
    }

    async fn insert_run(
        conn: &mut PgConnection,
        repo_id: &str,
        git_ref: &str,
        commit_sha: &str,
    ) -> Result<Run, CoreError> {
        let run = sqlx::query_as::<_, Run>(
            r#"
            INSERT INTO runs (id, repo_id, git_ref, commit_sha, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'created', NOW(), NOW())
            RETURNING id, repo_id, git_ref, commit_sha, state, started_at, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(repo_id)
        .bind(git_ref)
        .bind(commit_sha)
        .fetch_one(conn)
        .await?;

        Ok(run)
    }

    /// Manual run creation.
    pub async fn create_run(
        &self,
        repo_id: &str,
        git_ref: &str,
        commit_sha: &str,
    ) -> Result<Run, CoreError> {
        Self::validate_create(repo_id, git_ref, commit_sha)?;

        let mut tx = self.pool().begin().await?;
        let run = Self::insert_run(&mut tx, repo_id, git_ref, commit_sha).await?;
        tx.commit().await?;

        self.kernel.metrics.runs_created.fetch_add(1, Ordering::Relaxed);
        info!(run_id = %run.id, repo_id, "run created");

        self.start_run(run).await
    }

    /// Webhook entry point. The run insert and the trigger claim share one
    /// transaction, so a losing duplicate delivery leaves no stray run.
    pub async fn create_run_from_trigger(
        &self,
        provider: &str,
        event_type: &str,
        repo_id: &str,
        git_ref: &str,
        commit_sha: &str,
        pr_number: Option<i64>,
    ) -> Result<CreateOutcome, CoreError> {
        Self::validate_create(repo_id, git_ref, commit_sha)?;
        let event_key = RunTrigger::event_key(repo_id, commit_sha, event_type, pr_number);

        let mut tx = self.pool().begin().await?;
        let run = Self::insert_run(&mut tx, repo_id, git_ref, commit_sha).await?;
        match RunTrigger::claim(&mut tx, provider, &event_key, run.id).await? {
            Some(existing_id) => {
                tx.rollback().await?;
                let existing = Run::find_by_id(existing_id, self.pool()).await?;
                debug!(run_id = %existing_id, provider, "duplicate trigger; returning existing run");
                return Ok(CreateOutcome::Existing(existing));
            }
            None => {
                tx.commit().await?;
            }
        }

        self.kernel.metrics.runs_created.fetch_add(1, Ordering::Relaxed);
        info!(run_id = %run.id, provider, event_type, "run created from trigger");

        let run = self.start_run(run).await?;
        Ok(CreateOutcome::Created(run))
    }

    /// Rerun entry point, idempotent on the client-supplied key.
    pub async fn rerun_run(
        &self,
        original_run_id: Uuid,
        idempotency_key: &str,
    ) -> Result<CreateOutcome, CoreError> {
        if idempotency_key.trim().is_empty() {
            return Err(CoreError::Validation(
                "Idempotency-Key must not be empty".into(),
            ));
        }
        let original = Run::find_by_id(original_run_id, self.pool())
            .await
            .map_err(|_| CoreError::NotFound {
                entity: "run",
                id: original_run_id.to_string(),
            })?;

        let mut tx = self.pool().begin().await?;
        let run = Self::insert_run(
            &mut tx,
            &original.repo_id,
            &original.git_ref,
            &original.commit_sha,
        )
        .await?;
        match RunRerun::claim(&mut tx, original_run_id, idempotency_key, run.id).await? {
            Some(prior_id) => {
                tx.rollback().await?;
                let prior = Run::find_by_id(prior_id, self.pool()).await?;
                debug!(run_id = %prior_id, "duplicate rerun; returning prior run");
                return Ok(CreateOutcome::Existing(prior));
            }
            None => {
                tx.commit().await?;
            }
        }

        self.kernel.metrics.runs_created.fetch_add(1, Ordering::Relaxed);
        info!(run_id = %run.id, original_run_id = %original_run_id, "rerun created");

        let run = self.start_run(run).await?;
        Ok(CreateOutcome::Created(run))
    }

    // =========================================================================
    // Planning
    // =========================================================================

    /// Plan the run and queue its root jobs.
    pub async fn start_run(&self, run: Run) -> Result<Run, CoreError> {
        let run = store::transition_run(self.pool(), run.id, RunState::Planning).await?;

        let request = PlanRequest {
            repo_id: run.repo_id.clone(),
            git_ref: run.git_ref.clone(),
            commit_sha: run.commit_sha.clone(),
        };
        let plan = match self.kernel.planner.plan(&request).await {
            Ok(plan) if !plan.jobs.is_empty() => plan,
            Ok(_) => {
                warn!(run_id = %run.id, "planner produced an empty plan");
                return self.fail_planning(run).await;
            }
            Err(e) => {
                error!(run_id = %run.id, error = %e, "planning failed");
                return self.fail_planning(run).await;
            }
        };

        self.persist_plan(&run, &plan).await?;

        info!(
            run_id = %run.id,
            jobs = plan.jobs.len(),
            source = plan.recipe_source.as_str(),
            "run planned"
        );

        store::transition_run(self.pool(), run.id, RunState::Queued).await
    }

    async fn fail_planning(&self, run: Run) -> Result<Run, CoreError> {
        self.kernel.metrics.plans_failed.fetch_add(1, Ordering::Relaxed);
        store::transition_run(self.pool(), run.id, RunState::PlanFailed).await?;
        let run = store::transition_run(self.pool(), run.id, RunState::Failed).await?;
        self.report_run(run.clone()).await;
        Ok(run)
    }

    /// Persist planned jobs, specs, attempt #1 rows, and dependency edges,
    /// then queue every job whose dependency set is empty.
    async fn persist_plan(&self, run: &Run, plan: &Plan) -> Result<(), CoreError> {
        let mut plan_row = RunPlan::builder()
            .run_id(run.id)
            .recipe_source(plan.recipe_source.as_str())
            .explanation(plan.explain.clone())
            .skipped_jobs(serde_json::to_value(&plan.skipped_jobs).map_err(anyhow::Error::from)?)
            .build();
        plan_row.recipe_id = plan.recipe_id;
        plan_row.recipe_version = plan.recipe_version;
        plan_row.fingerprint = plan.fingerprint.clone();
        plan_row.insert(self.pool()).await?;

        let mut ids_by_name: HashMap<String, Uuid> = HashMap::new();

        for planned in &plan.jobs {
            let job = Job::builder()
                .run_id(run.id)
                .name(planned.name.clone())
                .required(planned.required)
                .reason(planned.reason.clone())
                .build();
            let job = job.insert(self.pool()).await?;
            ids_by_name.insert(planned.name.clone(), job.id);

            JobSpecRow::insert(job.id, &planned.spec, self.pool()).await?;
            JobAttempt::builder()
                .job_id(job.id)
                .build()
                .insert(self.pool())
                .await?;
        }

        for planned in &plan.jobs {
            let job_id = ids_by_name[&planned.name];
            for dep_name in &planned.depends_on {
                let dep_id = ids_by_name.get(dep_name).ok_or_else(|| {
                    CoreError::Validation(format!(
                        "job {} depends on unknown job {}",
                        planned.name, dep_name
                    ))
                })?;
                if *dep_id == job_id {
                    return Err(CoreError::Validation(format!(
                        "job {} depends on itself",
                        planned.name
                    )));
                }
                JobDependency::insert(job_id, *dep_id, self.pool()).await?;
            }
        }

        for planned in &plan.jobs {
            if planned.depends_on.is_empty() {
                store::mark_job_queued(self.pool(), ids_by_name[&planned.name]).await?;
            }
        }

        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Pull the next ready attempt off the queue and grant it a lease.
    /// Returns `None` when the queue is empty or the delivery lost a race;
    /// both are normal.
    pub async fn grant_next_lease(&self) -> Result<Option<LeaseGranted>, CoreError> {
        let attempt_id = match queue::dequeue(
            self.pool(),
            self.kernel.config.queue_visibility_timeout_seconds,
        )
        .await
        {
            Ok(id) => id,
            Err(CoreError::QueueEmpty) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.kernel.metrics.queue_dequeues.fetch_add(1, Ordering::Relaxed);

        let token = self.kernel.lease_tokens.mint();
        let granted = match store::grant_lease(
            self.pool(),
            attempt_id,
            &token,
            self.kernel.config.default_lease_ttl_seconds,
            self.kernel.config.default_heartbeat_interval_seconds,
        )
        .await
        {
            Ok(granted) => granted,
            // A duplicate delivery or a cancel racing the grant. The queue
            // row is already gone or will be swept; nothing to dispatch.
            Err(CoreError::Transition(e)) => {
                debug!(attempt_id = %attempt_id, error = %e, "lease grant skipped");
                return Ok(None);
            }
            Err(CoreError::Database(e)) => {
                debug!(attempt_id = %attempt_id, error = %e, "lease grant lost a race");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.kernel.metrics.leases_granted.fetch_add(1, Ordering::Relaxed);

        // First grant moves the run into RUNNING.
        store::transition_run(self.pool(), granted.run.id, RunState::Running).await?;

        let spec_row = JobSpecRow::find_by_job(granted.job.id, self.pool())
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "job_spec",
                id: granted.job.id.to_string(),
            })?;
        let job_spec = spec_row.decode().map_err(CoreError::Internal)?;

        Ok(Some(LeaseGranted {
            run_id: granted.run.id,
            job_id: granted.job.id,
            lease_id: granted.lease.id,
            lease_ttl_seconds: granted.lease.ttl_seconds,
            heartbeat_interval_seconds: granted.lease.heartbeat_interval_seconds,
            max_runtime_seconds: self.kernel.config.max_run_seconds,
            job_spec,
        }))
    }

    // =========================================================================
    // Protocol message handling
    // =========================================================================

    pub async fn ack_lease(&self, msg: &AckLease) -> Result<(), CoreError> {
        store::acknowledge_lease(self.pool(), &msg.lease_id, &msg.runner_id).await?;
        debug!(runner_id = %msg.runner_id, "lease acknowledged");
        Ok(())
    }

    pub async fn heartbeat(&self, msg: &Heartbeat) -> Result<HeartbeatAck, CoreError> {
        let outcome = store::heartbeat_lease(self.pool(), &msg.lease_id, &msg.runner_id).await?;
        Ok(HeartbeatAck {
            extend_lease: true,
            new_lease_ttl_seconds: outcome.lease.ttl_seconds,
            cancel_requested: outcome.cancel_requested,
            cancel_deadline_seconds: self.kernel.config.cancel_deadline_seconds,
        })
    }

    pub async fn complete(&self, msg: &Complete) -> Result<(), CoreError> {
        let succeeded = msg.status == CompletionStatus::Succeeded;
        let outcome = store::complete_attempt(
            self.pool(),
            &msg.lease_id,
            &msg.runner_id,
            succeeded,
            msg.exit_code,
            msg.summary.as_deref(),
        )
        .await?;
        self.kernel
            .metrics
            .attempts_completed
            .fetch_add(1, Ordering::Relaxed);

        // Completion facts are recorded even when they lost a cancel race.
        for artifact in &msg.artifacts {
            Artifact::record(
                outcome.attempt.id,
                &artifact.artifact_type,
                &artifact.uri,
                self.pool(),
            )
            .await?;
        }

        info!(
            job_id = %outcome.job.id,
            attempt_id = %outcome.attempt.id,
            state = outcome.attempt.state.as_str(),
            "attempt completed"
        );

        if outcome.canceled {
            self.finalize_run_if_done(outcome.job.run_id).await?;
            return Ok(());
        }

        if succeeded {
            self.queue_ready_dependents(outcome.job.id).await?;
        } else {
            self.handle_failed_attempt(&outcome, msg).await?;
        }

        self.finalize_run_if_done(outcome.job.run_id).await?;
        Ok(())
    }

    pub async fn cancel_ack(&self, msg: &CancelAck) -> Result<(), CoreError> {
        let outcome = store::acknowledge_cancel(self.pool(), &msg.lease_id, &msg.runner_id).await?;
        info!(job_id = %outcome.job.id, "cancel acknowledged by runner");
        self.finalize_run_if_done(outcome.job.run_id).await?;
        Ok(())
    }

    // =========================================================================
    // Failure analysis and retry
    // =========================================================================

    async fn handle_failed_attempt(
        &self,
        outcome: &store::CompletionOutcome,
        msg: &Complete,
    ) -> Result<(), CoreError> {
        let max_cache_events = self
            .kernel
            .config
            .ai
            .max_cache_events
            .max(1) as i64;
        let cache_events = CacheEvent::find_by_attempt(
            outcome.attempt.id,
            max_cache_events,
            self.pool(),
        )
        .await?
        .into_iter()
        .map(|e| format!("{} {}", e.event, e.cache_key))
        .collect();

        let duration_seconds = msg
            .timings
            .as_ref()
            .and_then(|t| t.duration_seconds)
            .or_else(|| {
                let t = msg.timings.as_ref()?;
                Some((t.finished_at? - t.started_at?).num_seconds())
            });

        let facts = FailureFacts {
            job_name: outcome.job.name.clone(),
            exit_code: msg.exit_code,
            summary: msg.summary.clone().unwrap_or_default(),
            attempt_number: outcome.attempt.attempt_number,
            duration_seconds,
            artifact_types: msg
                .artifacts
                .iter()
                .map(|a| a.artifact_type.clone())
                .collect(),
            cache_events,
            canceled: false,
            timed_out: outcome.attempt.state == JobState::TimedOut,
        };

        let classification = classify(&facts);
        let mut details = serde_json::json!({ "source": "rules" });

        // The AI advisor is advisory only: its failures never block the
        // rule-based result.
        if let Some(advisor) = &self.kernel.ai_advisor {
            let has_log = facts.artifact_types.iter().any(|t| t == "log");
            match advisor.explain(&facts, has_log).await {
                Ok(text) => {
                    JobAiExplanation::builder()
                        .job_attempt_id(outcome.attempt.id)
                        .provider(advisor.provider())
                        .model(advisor.model())
                        .prompt_version(advisor.prompt_version())
                        .output(text.clone())
                        .build()
                        .upsert(self.pool())
                        .await?;
                    details["ai_advice"] = serde_json::Value::String(text);
                }
                Err(e) => {
                    self.kernel.metrics.ai_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt_id = %outcome.attempt.id, error = %e, "AI advisor unavailable");
                }
            }
        }

        FailureExplanation::builder()
            .job_attempt_id(outcome.attempt.id)
            .category(classification.category)
            .confidence(classification.confidence)
            .summary(classification.summary.clone())
            .details(details)
            .build()
            .upsert(self.pool())
            .await?;

        let retries_remain = outcome.job.attempt_count < self.kernel.config.max_job_attempts;
        if classification.category.is_retryable() && retries_remain {
            let backoff = queue::retry_backoff_seconds(outcome.job.attempt_count);
            let attempt = store::create_retry_attempt(
                self.pool(),
                outcome.job.id,
                Duration::seconds(backoff),
            )
            .await?;
            self.kernel.metrics.attempts_retried.fetch_add(1, Ordering::Relaxed);
            info!(
                job_id = %outcome.job.id,
                attempt_number = attempt.attempt_number,
                backoff_seconds = backoff,
                "retrying failed attempt"
            );
        }

        Ok(())
    }

    // =========================================================================
    // Dependency gating
    // =========================================================================

    /// Queue dependents of a newly SUCCEEDED job whose remaining dependency
    /// count reached zero.
    pub async fn queue_ready_dependents(&self, job_id: Uuid) -> Result<(), CoreError> {
        let dependents = JobDependency::dependents_of(job_id, self.pool()).await?;
        for dependent_id in dependents {
            let dependent = Job::find_by_id(dependent_id, self.pool()).await?;
            if dependent.state != JobState::Created {
                continue;
            }
            let unsatisfied = JobDependency::unsatisfied_count(dependent_id, self.pool()).await?;
            if unsatisfied == 0 {
                store::mark_job_queued(self.pool(), dependent_id).await?;
                debug!(job_id = %dependent_id, "dependencies satisfied; job queued");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Cancellation and timeout
    // =========================================================================

    /// User-initiated cancel. Idempotent; rejects terminal runs.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run, CoreError> {
        let run = Run::find_by_id(run_id, self.pool())
            .await
            .map_err(|_| CoreError::NotFound {
                entity: "run",
                id: run_id.to_string(),
            })?;

        if matches!(run.state, RunState::CancelRequested | RunState::Canceled) {
            return Ok(run);
        }

        let run = store::transition_run(self.pool(), run_id, RunState::CancelRequested).await?;
        self.cancel_outstanding_jobs(run_id).await?;

        // Every job may already be settled, in which case the run is done.
        if let Some(run) = self.finalize_run_if_done(run_id).await? {
            return Ok(run);
        }
        Ok(run)
    }

    /// Queued jobs cancel immediately; executing jobs are asked to stop and
    /// learn about it on their next heartbeat.
    async fn cancel_outstanding_jobs(&self, run_id: Uuid) -> Result<(), CoreError> {
        let jobs = Job::find_by_run(run_id, self.pool()).await?;
        for job in jobs {
            if job.state.is_queuable() {
                store::cancel_job_immediately(self.pool(), job.id).await?;
            } else if job.state.is_executing() {
                store::request_job_cancel(self.pool(), job.id).await?;
            }
        }
        Ok(())
    }

    /// Sweep entry: a RUNNING run exceeded its max runtime.
    pub async fn timeout_run(&self, run_id: Uuid) -> Result<Run, CoreError> {
        let run = store::transition_run(self.pool(), run_id, RunState::Timeout).await?;
        warn!(run_id = %run_id, "run timed out");
        self.cancel_outstanding_jobs(run_id).await?;
        self.kernel.metrics.runs_finalized.fetch_add(1, Ordering::Relaxed);
        self.report_run(run.clone()).await;
        Ok(run)
    }

    /// Sweep entry: force jobs stuck in CANCEL_REQUESTED past the deadline.
    pub async fn force_cancel_job(&self, job_id: Uuid) -> Result<(), CoreError> {
        let job = store::force_cancel_job(self.pool(), job_id).await?;
        self.finalize_run_if_done(job.run_id).await?;
        Ok(())
    }

    // =========================================================================
    // Finalization and reporting
    // =========================================================================

    /// Recompute the run outcome under the run lock. Returns the finalized
    /// run if a terminal transition happened.
    pub async fn finalize_run_if_done(&self, run_id: Uuid) -> Result<Option<Run>, CoreError> {
        let finalized = {
            let mut tx = self.pool().begin().await?;
            let run = store::lock_run(&mut tx, run_id).await?;

            // Jobs only settle under leases, and the first grant moved the
            // run to RUNNING; anything else has nothing to finalize.
            if !matches!(run.state, RunState::Running | RunState::CancelRequested) {
                tx.rollback().await?;
                return Ok(None);
            }

            let jobs = sqlx::query_as::<_, Job>(
                r#"
                SELECT id, run_id, name, required, state, attempt_count, reason, created_at, updated_at
                FROM jobs
                WHERE run_id = $1
                "#,
            )
            .bind(run_id)
            .fetch_all(&mut *tx)
            .await?;

            let next = if run.state == RunState::CancelRequested {
                if jobs.iter().all(|j| j.state.is_terminal()) {
                    Some(RunState::Canceled)
                } else {
                    None
                }
            } else {
                let required: Vec<&Job> = jobs.iter().filter(|j| j.required).collect();
                if required.iter().any(|j| !j.state.is_terminal()) {
                    None
                } else if required.iter().all(|j| j.state == JobState::Succeeded) {
                    Some(RunState::Success)
                } else {
                    // A required job settled in FAILED/TIMED_OUT/CANCELED
                    // with no retry pending.
                    Some(RunState::Failed)
                }
            };

            match next {
                Some(next) => {
                    let run = store::set_run_state(&mut tx, &run, next).await?;
                    tx.commit().await?;
                    Some(run)
                }
                None => {
                    tx.rollback().await?;
                    None
                }
            }
        };

        let Some(run) = finalized else {
            return Ok(None);
        };

        self.kernel.metrics.runs_finalized.fetch_add(1, Ordering::Relaxed);
        info!(run_id = %run.id, state = run.state.as_str(), "run finalized");

        self.report_run(run.clone()).await;
        let run = Run::find_by_id(run.id, self.pool()).await?;
        Ok(Some(run))
    }

    /// Post the terminal state to the status reporter and mark the run
    /// REPORTED. Reporter failures are logged and metered, never fatal; the
    /// reporting sweep retries later.
    pub async fn report_run(&self, run: Run) {
        if !run.state.is_reportable() {
            return;
        }
        match self.kernel.status_reporter.report(&run).await {
            Ok(()) => {
                if let Err(e) =
                    store::transition_run(self.pool(), run.id, RunState::Reported).await
                {
                    error!(run_id = %run.id, error = %e, "failed to mark run reported");
                }
            }
            Err(e) => {
                self.kernel
                    .metrics
                    .report_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(run_id = %run.id, error = %e, "status report failed");
            }
        }
    }
}
