//! Artifact metadata reported by runners on completion. URIs are stored
//! verbatim and treated as untrusted; consumers sanitize on use.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub job_attempt_id: Uuid,
    pub artifact_type: String,
    pub uri: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Idempotent insert: re-delivered Complete messages may repeat URIs.
    pub async fn record(
        job_attempt_id: Uuid,
        artifact_type: &str,
        uri: &str,
        db: &sqlx::PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_artifacts (id, job_attempt_id, artifact_type, uri, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (job_attempt_id, uri) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_attempt_id)
        .bind(artifact_type)
        .bind(uri)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn find_by_attempt(job_attempt_id: Uuid, db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let artifacts = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_attempt_id, artifact_type, uri, created_at
            FROM job_artifacts
            WHERE job_attempt_id = $1
            ORDER BY created_at, uri
            "#,
        )
        .bind(job_attempt_id)
        .fetch_all(db)
        .await?;

        Ok(artifacts)
    }
}
