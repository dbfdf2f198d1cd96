//! API error envelope: `{"error": {"code", "message", "details?"}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::common::error::CoreError;
use crate::protocol::StaleLease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    InvalidState,
    StaleLease,
    InternalError,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ApiErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    error: Body<'a>,
}

#[derive(Serialize)]
struct Body<'a> {
    code: ApiErrorCode,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a serde_json::Value>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ApiErrorCode::InvalidRequest,
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: ApiErrorCode::Unauthorized,
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: ApiErrorCode::NotFound,
            message: message.into(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = Envelope {
            error: Body {
                code: self.code,
                message: &self.message,
                details: self.details.as_ref(),
            },
        };
        (self.status, Json(envelope)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match &err {
            CoreError::Validation(msg) => ApiError::bad_request(msg.clone()),
            CoreError::NotFound { .. } => ApiError::not_found(err.to_string()),
            CoreError::Transition(t) => ApiError {
                status: StatusCode::CONFLICT,
                code: ApiErrorCode::InvalidState,
                message: t.to_string(),
                details: None,
            },
            CoreError::StaleLease { lease_id, reason } => ApiError {
                status: StatusCode::CONFLICT,
                code: ApiErrorCode::StaleLease,
                message: "lease no longer carries authority".to_string(),
                details: serde_json::to_value(StaleLease {
                    lease_id: lease_id.clone(),
                    reason: *reason,
                })
                .ok(),
            },
            // Signals and advisory failures never reach the API layer; if
            // one does, it is a bug worth a 500.
            CoreError::QueueEmpty
            | CoreError::AiUnavailable(_)
            | CoreError::AiCircuitOpen
            | CoreError::Database(_)
            | CoreError::Internal(_) => {
                tracing::error!(error = %err, "internal error surfaced to API");
                ApiError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: ApiErrorCode::InternalError,
                    message: "internal error".to_string(),
                    details: None,
                }
            }
        }
    }
}
