//! Diff-aware planner.
//!
//! A pure, deterministic function of `(repo_id, ref, commit_sha, repo
//! snapshot, recipe store)`: discover projects, fingerprint build-identity
//! files, pick a plan source (explicit config beats recipes beats diff
//! discovery beats fallback), analyze change impact, and emit a job DAG
//! with a reason on every job and every skip. Unknowns always expand the
//! plan, never shrink it.

pub mod diff;
pub mod discovery;
pub mod fingerprint;
pub mod impact;
pub mod recipe;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domains::jobs::models::{CacheSpec, JobSpec};
use crate::domains::runs::models::SkippedJob;
use discovery::{Discovery, Project};
use recipe::Recipe;

/// Where a plan came from; recorded on the run for explainability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipeSource {
    Config,
    Recipe,
    Discovery,
    Fallback,
}

impl RecipeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RecipeSource::Config => "config",
            RecipeSource::Recipe => "recipe",
            RecipeSource::Discovery => "discovery",
            RecipeSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub repo_id: String,
    pub git_ref: String,
    pub commit_sha: String,
}

/// One job the planner decided to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedJob {
    pub name: String,
    pub required: bool,
    pub reason: String,
    /// Names of jobs this one depends on.
    pub depends_on: Vec<String>,
    pub spec: JobSpec,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub jobs: Vec<PlannedJob>,
    pub explain: String,
    pub skipped_jobs: Vec<SkippedJob>,
    pub fingerprint: Option<String>,
    pub recipe_source: RecipeSource,
    pub recipe_id: Option<Uuid>,
    pub recipe_version: Option<i32>,
}

/// The planner capability. Swappable so tests can inject fixed plans.
#[async_trait]
pub trait BasePlanner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan>;
}

/// Production planner working against local repository snapshots under a
/// configured root, with recipes persisted in Postgres.
pub struct DefaultPlanner {
    repo_root: PathBuf,
    db_pool: sqlx::PgPool,
}

impl DefaultPlanner {
    pub fn new(repo_root: impl Into<PathBuf>, db_pool: sqlx::PgPool) -> Self {
        Self {
            repo_root: repo_root.into(),
            db_pool,
        }
    }
}

#[async_trait]
impl BasePlanner for DefaultPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan> {
        let repo_dir = self.repo_root.join(&request.repo_id);

        if !repo_dir.is_dir() {
            warn!(repo_id = %request.repo_id, "repository snapshot unavailable; using fallback plan");
            return Ok(fallback_plan(
                request,
                RecipeSource::Fallback,
                None,
                None,
                "repository snapshot unavailable",
            ));
        }

        let discovered = discovery::discover(&repo_dir)?;
        let fp = fingerprint::compute(&repo_dir, &discovered.fingerprint_inputs)?;

        // Explicit config always wins; recipes never override it.
        if discovered.has_ci_config {
            let cache = root_deps_cache(&repo_dir, &discovered, request);
            return Ok(fallback_plan(
                request,
                RecipeSource::Config,
                Some(fp),
                cache,
                "explicit ci.ai.yaml present",
            ));
        }

        if let Some(recipe) = Recipe::find_latest(&request.repo_id, &fp, &self.db_pool).await? {
            debug!(recipe_id = %recipe.id, version = recipe.version, "plan served from recipe");
            let jobs: Vec<PlannedJob> = serde_json::from_value(recipe.plan.clone())?;
            return Ok(Plan {
                jobs,
                explain: format!(
                    "recipe: reused plan version {} for fingerprint {}",
                    recipe.version,
                    &fp[..12.min(fp.len())]
                ),
                skipped_jobs: vec![],
                fingerprint: Some(fp),
                recipe_source: RecipeSource::Recipe,
                recipe_id: Some(recipe.id),
                recipe_version: Some(recipe.version),
            });
        }

        let changed = match diff::changed_paths(&repo_dir, &request.commit_sha).await {
            Ok(paths) if !paths.is_empty() => paths,
            Ok(_) => {
                let cache = root_deps_cache(&repo_dir, &discovered, request);
                return Ok(fallback_plan(
                    request,
                    RecipeSource::Fallback,
                    Some(fp),
                    cache,
                    "empty diff",
                ));
            }
            Err(e) => {
                warn!(commit_sha = %request.commit_sha, error = %e, "diff unavailable; using fallback plan");
                let cache = root_deps_cache(&repo_dir, &discovered, request);
                return Ok(fallback_plan(
                    request,
                    RecipeSource::Fallback,
                    Some(fp),
                    cache,
                    "diff unavailable",
                ));
            }
        };

        let analysis = impact::analyze(&changed, &discovered.projects);
        let mut plan = build_discovery_plan(request, &repo_dir, &discovered, &changed, &analysis);
        plan.fingerprint = Some(fp.clone());

        // Persist the plan shape for reuse, but only when it covers every
        // project. Recipes are keyed by fingerprint, not by diff, so a
        // narrowed plan must never be replayed against a different change.
        let full_coverage =
            !analysis.docs_only && analysis.impacted.len() == discovered.projects.len();
        if full_coverage {
            let recipe = Recipe::record(
                &request.repo_id,
                &fp,
                serde_json::to_value(&plan.jobs)?,
                &self.db_pool,
            )
            .await?;
            if let Some(recipe) = recipe {
                plan.recipe_id = Some(recipe.id);
                plan.recipe_version = Some(recipe.version);
            }
        }

        Ok(plan)
    }
}

fn job_name(kind: &str, project_root: &str) -> String {
    if project_root == "." {
        kind.to_string()
    } else {
        format!("{kind}:{project_root}")
    }
}

fn is_pull_request_ref(git_ref: &str) -> bool {
    git_ref.starts_with("refs/pull/")
}

/// Dependency cache for a project: keyed on the content of its module
/// files, read-only on pull-request refs.
fn deps_cache(repo_dir: &std::path::Path, project: &Project, git_ref: &str) -> CacheSpec {
    let mut hasher = Sha256::new();
    for file in ["go.mod", "go.sum"] {
        let path = if project.root == "." {
            repo_dir.join(file)
        } else {
            repo_dir.join(&project.root).join(file)
        };
        if let Ok(bytes) = std::fs::read(path) {
            hasher.update(&bytes);
        }
    }
    CacheSpec {
        key: format!("go:deps:{}", hex::encode(hasher.finalize())),
        path: "~/go/pkg/mod".to_string(),
        read_only: is_pull_request_ref(git_ref),
    }
}

fn root_deps_cache(
    repo_dir: &std::path::Path,
    discovered: &Discovery,
    request: &PlanRequest,
) -> Option<CacheSpec> {
    discovered
        .projects
        .iter()
        .find(|p| p.root == ".")
        .map(|p| deps_cache(repo_dir, p, &request.git_ref))
}

fn step_spec(kind: &str, project_root: &str, cache: CacheSpec) -> JobSpec {
    let steps = match kind {
        "build" => vec!["go build ./...".to_string()],
        "test" => vec!["go test ./...".to_string()],
        _ => vec!["go vet ./...".to_string()],
    };
    JobSpec {
        name: job_name(kind, project_root),
        workdir: project_root.to_string(),
        steps,
        env: Default::default(),
        caches: vec![cache],
        artifacts: vec![],
    }
}

fn build_discovery_plan(
    request: &PlanRequest,
    repo_dir: &std::path::Path,
    discovered: &Discovery,
    changed: &[String],
    analysis: &impact::ImpactAnalysis,
) -> Plan {
    let mut jobs = Vec::new();
    let mut skipped = Vec::new();

    for (idx, reason) in &analysis.impacted {
        let project = &discovered.projects[*idx];
        let cache = deps_cache(repo_dir, project, &request.git_ref);

        let build = job_name("build", &project.root);
        jobs.push(PlannedJob {
            name: build.clone(),
            required: true,
            reason: reason.clone(),
            depends_on: vec![],
            spec: step_spec("build", &project.root, cache.clone()),
        });

        if analysis.docs_only {
            skipped.push(SkippedJob {
                name: job_name("test", &project.root),
                reason: "docs-only change: tests skipped".to_string(),
            });
            skipped.push(SkippedJob {
                name: job_name("lint", &project.root),
                reason: "docs-only change: lint skipped".to_string(),
            });
            continue;
        }

        jobs.push(PlannedJob {
            name: job_name("test", &project.root),
            required: true,
            reason: reason.clone(),
            depends_on: vec![build.clone()],
            spec: step_spec("test", &project.root, cache.clone()),
        });
        jobs.push(PlannedJob {
            name: job_name("lint", &project.root),
            required: false,
            reason: reason.clone(),
            depends_on: vec![build],
            spec: step_spec("lint", &project.root, cache),
        });
    }

    let explain = format!(
        "discovery: {} of {} projects impacted by {} changed paths{}",
        analysis.impacted.len(),
        discovered.projects.len(),
        changed.len(),
        if analysis.docs_only {
            "; docs-only change"
        } else {
            ""
        }
    );

    Plan {
        jobs,
        explain,
        skipped_jobs: skipped,
        fingerprint: None,
        recipe_source: RecipeSource::Discovery,
        recipe_id: None,
        recipe_version: None,
    }
}

/// Static plan used when the repo, diff, or config dictates it: root build
/// and test (required) plus lint (allow-failure). Uncertainty expands the
/// plan, so nothing is skipped here.
fn fallback_plan(
    request: &PlanRequest,
    source: RecipeSource,
    fingerprint: Option<String>,
    cache: Option<CacheSpec>,
    why: &str,
) -> Plan {
    let cache = cache.unwrap_or_else(|| CacheSpec {
        key: "go:deps:unknown".to_string(),
        path: "~/go/pkg/mod".to_string(),
        read_only: is_pull_request_ref(&request.git_ref),
    });
    let reason = format!("{}: {}", source.as_str(), why);

    let jobs = vec![
        PlannedJob {
            name: "build".to_string(),
            required: true,
            reason: reason.clone(),
            depends_on: vec![],
            spec: step_spec("build", ".", cache.clone()),
        },
        PlannedJob {
            name: "test".to_string(),
            required: true,
            reason: reason.clone(),
            depends_on: vec!["build".to_string()],
            spec: step_spec("test", ".", cache.clone()),
        },
        PlannedJob {
            name: "lint".to_string(),
            required: false,
            reason,
            depends_on: vec!["build".to_string()],
            spec: step_spec("lint", ".", cache),
        },
    ];

    Plan {
        jobs,
        explain: format!("{}: {}", source.as_str(), why),
        skipped_jobs: vec![],
        fingerprint,
        recipe_source: source,
        recipe_id: None,
        recipe_version: None,
    }
}
