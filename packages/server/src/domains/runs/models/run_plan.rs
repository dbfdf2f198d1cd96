//! Persisted plan metadata for a run: where the plan came from, the repo
//! fingerprint, the human-readable explanation, and any intentionally
//! skipped jobs with their reasons.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// A job the planner intentionally omitted, with the reason it was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedJob {
    pub name: String,
    pub reason: String,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct RunPlan {
    pub run_id: Uuid,

    /// One of `config`, `recipe`, `discovery`, `fallback`.
    pub recipe_source: String,
    #[builder(default, setter(strip_option))]
    pub recipe_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub recipe_version: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub fingerprint: Option<String>,

    #[serde(rename = "explain")]
    pub explanation: String,
    /// JSON array of [`SkippedJob`].
    #[builder(default = serde_json::Value::Array(vec![]))]
    pub skipped_jobs: serde_json::Value,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

impl RunPlan {
    pub fn skipped(&self) -> Vec<SkippedJob> {
        serde_json::from_value(self.skipped_jobs.clone()).unwrap_or_default()
    }

    pub async fn find_by_run(run_id: Uuid, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let plan = sqlx::query_as::<_, Self>(
            r#"
            SELECT run_id, recipe_source, recipe_id, recipe_version, fingerprint,
                   explanation, skipped_jobs, created_at
            FROM run_plans
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(db)
        .await?;

        Ok(plan)
    }

    pub async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let plan = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO run_plans (run_id, recipe_source, recipe_id, recipe_version,
                                   fingerprint, explanation, skipped_jobs, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_id) DO UPDATE SET
                recipe_source = EXCLUDED.recipe_source,
                recipe_id = EXCLUDED.recipe_id,
                recipe_version = EXCLUDED.recipe_version,
                fingerprint = EXCLUDED.fingerprint,
                explanation = EXCLUDED.explanation,
                skipped_jobs = EXCLUDED.skipped_jobs
            RETURNING run_id, recipe_source, recipe_id, recipe_version, fingerprint,
                      explanation, skipped_jobs, created_at
            "#,
        )
        .bind(self.run_id)
        .bind(&self.recipe_source)
        .bind(self.recipe_id)
        .bind(self.recipe_version)
        .bind(&self.fingerprint)
        .bind(&self.explanation)
        .bind(&self.skipped_jobs)
        .bind(self.created_at)
        .fetch_one(db)
        .await?;

        Ok(plan)
    }
}
