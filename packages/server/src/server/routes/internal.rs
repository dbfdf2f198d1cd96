//! Protocol endpoints for runner messages.
//!
//! Each endpoint decodes strictly (unknown fields rejected at the serde
//! layer), delegates to the orchestrator, and maps errors onto the API
//! envelope: stale lease -> 409 STALE_LEASE with an explicit `StaleLease`
//! body so the runner can self-terminate.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::common::error::CoreError;
use crate::protocol::{AckLease, CancelAck, Complete, Heartbeat, HeartbeatAck};
use crate::server::app::AppState;
use crate::server::error::ApiError;

fn track_stale(state: &AppState, err: CoreError) -> ApiError {
    if matches!(err, CoreError::StaleLease { .. }) {
        state
            .kernel
            .metrics
            .stale_lease_rejections
            .fetch_add(1, Ordering::Relaxed);
    }
    err.into()
}

pub async fn protocol_ack_lease(
    State(state): State<AppState>,
    Json(msg): Json<AckLease>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .ack_lease(&msg)
        .await
        .map_err(|e| track_stale(&state, e))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn protocol_heartbeat(
    State(state): State<AppState>,
    Json(msg): Json<Heartbeat>,
) -> Result<Json<HeartbeatAck>, ApiError> {
    let ack = state
        .orchestrator
        .heartbeat(&msg)
        .await
        .map_err(|e| track_stale(&state, e))?;
    Ok(Json(ack))
}

pub async fn protocol_complete(
    State(state): State<AppState>,
    Json(msg): Json<Complete>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .complete(&msg)
        .await
        .map_err(|e| track_stale(&state, e))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn protocol_cancel_ack(
    State(state): State<AppState>,
    Json(msg): Json<CancelAck>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .cancel_ack(&msg)
        .await
        .map_err(|e| track_stale(&state, e))?;
    Ok(StatusCode::NO_CONTENT)
}
