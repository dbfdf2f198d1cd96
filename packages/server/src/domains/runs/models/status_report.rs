//! Commit-status report attempts. Owned by the status reporter; the
//! orchestrator only reads these for audit.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct StatusReport {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub run_id: Uuid,
    pub provider: String,
    /// Terminal run state this report describes.
    pub state: String,
    #[builder(default, setter(strip_option))]
    pub detail: Option<String>,
    #[builder(default = Utc::now())]
    pub posted_at: DateTime<Utc>,
}

impl StatusReport {
    pub async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let report = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO vcs_status_reports (id, run_id, provider, state, detail, posted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, run_id, provider, state, detail, posted_at
            "#,
        )
        .bind(self.id)
        .bind(self.run_id)
        .bind(&self.provider)
        .bind(&self.state)
        .bind(&self.detail)
        .bind(self.posted_at)
        .fetch_one(db)
        .await?;

        Ok(report)
    }

    pub async fn find_by_run(run_id: Uuid, db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let reports = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, run_id, provider, state, detail, posted_at
            FROM vcs_status_reports
            WHERE run_id = $1
            ORDER BY posted_at
            "#,
        )
        .bind(run_id)
        .fetch_all(db)
        .await?;

        Ok(reports)
    }
}
