//! Persisted failure classifications. One explanation per attempt; a
//! re-classification replaces the prior row. AI output is stored separately
//! for audit and never feeds back into state transitions.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "snake_case")]
pub enum FailureCategory {
    User,
    Infra,
    Tooling,
    Flaky,
    Canceled,
    #[default]
    Unknown,
}

impl FailureCategory {
    /// Whether failures in this category warrant another attempt.
    /// Infrastructure and tooling problems are environmental; user code
    /// failing the same way twice is just user code failing.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureCategory::Infra | FailureCategory::Tooling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "snake_case")]
pub enum FailureConfidence {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct FailureExplanation {
    pub job_attempt_id: Uuid,
    pub category: FailureCategory,
    pub confidence: FailureConfidence,
    pub summary: String,
    #[builder(default = serde_json::Value::Null)]
    pub details: serde_json::Value,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl FailureExplanation {
    /// Upsert keyed by attempt, replacing any prior explanation.
    pub async fn upsert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO job_failure_explanations
                (job_attempt_id, category, confidence, summary, details, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_attempt_id) DO UPDATE SET
                category = EXCLUDED.category,
                confidence = EXCLUDED.confidence,
                summary = EXCLUDED.summary,
                details = EXCLUDED.details,
                updated_at = NOW()
            RETURNING job_attempt_id, category, confidence, summary, details, created_at, updated_at
            "#,
        )
        .bind(self.job_attempt_id)
        .bind(self.category)
        .bind(self.confidence)
        .bind(&self.summary)
        .bind(&self.details)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(row)
    }

    pub async fn find_by_attempt(job_attempt_id: Uuid, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT job_attempt_id, category, confidence, summary, details, created_at, updated_at
            FROM job_failure_explanations
            WHERE job_attempt_id = $1
            "#,
        )
        .bind(job_attempt_id)
        .fetch_optional(db)
        .await?;

        Ok(row)
    }
}

/// Advisory AI output kept for audit, keyed by attempt.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobAiExplanation {
    pub job_attempt_id: Uuid,
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
    pub output: String,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

impl JobAiExplanation {
    pub async fn upsert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO job_failure_ai_explanations
                (job_attempt_id, provider, model, prompt_version, output, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_attempt_id) DO UPDATE SET
                provider = EXCLUDED.provider,
                model = EXCLUDED.model,
                prompt_version = EXCLUDED.prompt_version,
                output = EXCLUDED.output
            RETURNING job_attempt_id, provider, model, prompt_version, output, created_at
            "#,
        )
        .bind(self.job_attempt_id)
        .bind(&self.provider)
        .bind(&self.model)
        .bind(&self.prompt_version)
        .bind(&self.output)
        .bind(self.created_at)
        .fetch_one(db)
        .await?;

        Ok(row)
    }
}
