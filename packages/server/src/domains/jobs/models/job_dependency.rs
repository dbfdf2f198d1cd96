//! Job dependency edges. The edges form a DAG; the schema rejects
//! self-edges and the planner only emits forward references.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobDependency {
    pub job_id: Uuid,
    pub depends_on_job_id: Uuid,
}

impl JobDependency {
    pub async fn insert(job_id: Uuid, depends_on_job_id: Uuid, db: &sqlx::PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_dependencies (job_id, depends_on_job_id)
            VALUES ($1, $2)
            ON CONFLICT (job_id, depends_on_job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(depends_on_job_id)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Jobs that `job_id` depends on.
    pub async fn dependencies_of(job_id: Uuid, db: &sqlx::PgPool) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT depends_on_job_id FROM job_dependencies WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_all(db)
        .await?;

        Ok(ids)
    }

    /// Jobs that depend on `job_id`.
    pub async fn dependents_of(job_id: Uuid, db: &sqlx::PgPool) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT job_id FROM job_dependencies WHERE depends_on_job_id = $1",
        )
        .bind(job_id)
        .fetch_all(db)
        .await?;

        Ok(ids)
    }

    /// Count of `job_id`'s dependencies that have not yet SUCCEEDED.
    pub async fn unsatisfied_count(job_id: Uuid, db: &sqlx::PgPool) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM job_dependencies d
            JOIN jobs j ON j.id = d.depends_on_job_id
            WHERE d.job_id = $1 AND j.state <> 'succeeded'
            "#,
        )
        .bind(job_id)
        .fetch_one(db)
        .await?;

        Ok(count)
    }
}
