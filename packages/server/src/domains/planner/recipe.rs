//! Persisted plan recipes, keyed `(repo_id, fingerprint, version)`.
//! Immutable once written; a new snapshot fingerprint gets a new row.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: Uuid,
    pub repo_id: String,
    pub fingerprint: String,
    pub version: i32,
    /// JSON array of planned jobs.
    pub plan: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Recipe {
    /// Latest recipe version for a `(repo_id, fingerprint)` pair.
    pub async fn find_latest(
        repo_id: &str,
        fingerprint: &str,
        db: &sqlx::PgPool,
    ) -> Result<Option<Self>> {
        let recipe = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, repo_id, fingerprint, version, plan, created_at
            FROM recipes
            WHERE repo_id = $1 AND fingerprint = $2
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(repo_id)
        .bind(fingerprint)
        .fetch_optional(db)
        .await?;

        Ok(recipe)
    }

    /// Record a freshly discovered plan as version 1 for this fingerprint.
    /// A concurrent planner may have won the insert; either way the stored
    /// recipe is returned (None only if the lookup races a delete).
    pub async fn record(
        repo_id: &str,
        fingerprint: &str,
        plan: serde_json::Value,
        db: &sqlx::PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query(
            r#"
            INSERT INTO recipes (id, repo_id, fingerprint, version, plan, created_at)
            VALUES ($1, $2, $3, 1, $4, NOW())
            ON CONFLICT (repo_id, fingerprint, version) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(repo_id)
        .bind(fingerprint)
        .bind(&plan)
        .execute(db)
        .await?;

        Self::find_latest(repo_id, fingerprint, db).await
    }
}
