//! Job attempt model. A retry creates a new attempt row; prior attempts are
//! immutable history.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::job::JobState;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobAttempt {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub job_id: Uuid,
    #[builder(default = 1)]
    pub attempt_number: i32,

    #[builder(default)]
    pub state: JobState,
    #[builder(default, setter(strip_option))]
    pub lease_id: Option<String>,

    // Completion facts reported by the runner. Untrusted input.
    #[builder(default, setter(strip_option))]
    pub exit_code: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub summary: Option<String>,

    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, job_id, attempt_number, state, lease_id, exit_code, summary, \
                       started_at, completed_at, created_at, updated_at";

impl JobAttempt {
    pub async fn find_by_job(job_id: Uuid, db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let attempts = sqlx::query_as::<_, Self>(&format!(
            "SELECT {COLUMNS} FROM job_attempts WHERE job_id = $1 ORDER BY attempt_number"
        ))
        .bind(job_id)
        .fetch_all(db)
        .await?;

        Ok(attempts)
    }

    /// The most recent attempt for a job.
    pub async fn find_latest_for_job(job_id: Uuid, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let attempt = sqlx::query_as::<_, Self>(&format!(
            "SELECT {COLUMNS} FROM job_attempts WHERE job_id = $1 \
             ORDER BY attempt_number DESC LIMIT 1"
        ))
        .bind(job_id)
        .fetch_optional(db)
        .await?;

        Ok(attempt)
    }

    pub async fn find_by_id(id: Uuid, db: &sqlx::PgPool) -> Result<Self> {
        let attempt =
            sqlx::query_as::<_, Self>(&format!("SELECT {COLUMNS} FROM job_attempts WHERE id = $1"))
                .bind(id)
                .fetch_one(db)
                .await?;

        Ok(attempt)
    }

    pub async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let attempt = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO job_attempts (id, job_id, attempt_number, state, lease_id, exit_code,
                                      summary, started_at, completed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(self.job_id)
        .bind(self.attempt_number)
        .bind(self.state)
        .bind(&self.lease_id)
        .bind(self.exit_code)
        .bind(&self.summary)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(attempt)
    }
}
