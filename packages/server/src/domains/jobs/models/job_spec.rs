//! Immutable job specs, persisted as JSON alongside the job row.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A cache a runner may restore/save around the steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    pub key: String,
    pub path: String,
    /// Pull-request refs get read-only caches so untrusted code cannot
    /// poison shared entries.
    #[serde(default)]
    pub read_only: bool,
}

/// What a runner executes for one job. Produced by the planner, decoded for
/// the runner inside `LeaseGranted`, and never mutated after planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub workdir: String,
    pub steps: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    /// Paths the runner uploads after the steps finish.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Persisted spec row.
#[derive(FromRow, Debug, Clone)]
pub struct JobSpecRow {
    pub job_id: Uuid,
    pub spec: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl JobSpecRow {
    pub async fn insert(job_id: Uuid, spec: &JobSpec, db: &sqlx::PgPool) -> Result<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO job_specs (job_id, spec, created_at)
            VALUES ($1, $2, NOW())
            RETURNING job_id, spec, created_at
            "#,
        )
        .bind(job_id)
        .bind(serde_json::to_value(spec)?)
        .fetch_one(db)
        .await?;

        Ok(row)
    }

    pub async fn find_by_job(job_id: Uuid, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT job_id, spec, created_at FROM job_specs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(db)
        .await?;

        Ok(row)
    }

    pub fn decode(&self) -> Result<JobSpec> {
        Ok(serde_json::from_value(self.spec.clone())?)
    }
}
