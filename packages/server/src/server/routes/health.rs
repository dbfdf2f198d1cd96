//! Liveness endpoint and the metrics text dump.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use sqlx::FromRow;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    control_plane: Option<ControlPlaneHealth>,
}

/// Work the control plane is currently responsible for. Healthy numbers are
/// small and moving; a monotonically growing queue with zero live leases
/// means dispatch has stalled.
#[derive(FromRow, Serialize)]
pub struct ControlPlaneHealth {
    pub queued_attempts: i64,
    pub live_leases: i64,
    pub runs_in_flight: i64,
}

/// Health check: one aggregate query over the queue, lease, and run tables.
/// The counts double as the database probe, so a healthy reply always
/// carries real dispatch state. 200 when the store answers in time, 503
/// otherwise.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let probe = sqlx::query_as::<_, ControlPlaneHealth>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM job_queue) AS queued_attempts,
            (SELECT COUNT(*) FROM leases
             WHERE state IN ('granted', 'active')) AS live_leases,
            (SELECT COUNT(*) FROM runs
             WHERE state IN ('planning', 'queued', 'running', 'cancel_requested')) AS runs_in_flight
        "#,
    )
    .fetch_one(&state.kernel.db_pool);

    match tokio::time::timeout(std::time::Duration::from_secs(5), probe).await {
        Ok(Ok(control_plane)) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                error: None,
                control_plane: Some(control_plane),
            }),
        ),
        Ok(Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy",
                error: Some(format!("state store unavailable: {e}")),
                control_plane: None,
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy",
                error: Some("state store probe timed out".to_string()),
                control_plane: None,
            }),
        ),
    }
}

/// Plain-text process counters.
pub async fn metrics_handler(State(state): State<AppState>) -> String {
    state.kernel.metrics.render()
}
