//! Error kinds propagated as tagged results (never silent defaults) and
//! their transport mapping at the orchestrator edge.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("flow not published: {0}")]
    FlowNotPublished(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("flow validation failed: {0:?}")]
    FlowValidation(Vec<String>),

    #[error("revision conflict: expected {expected}, found {actual}")]
    RevisionConflict { expected: i64, actual: i64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("idempotency key already in progress: {0}")]
    IdempotencyInProgress(String),

    #[error("webhook call failed: {0}")]
    WebhookFailed(String),

    #[error("api call failed: {0}")]
    ApiCallFailed(String),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::FlowNotFound(_) | AppError::NodeNotFound(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            AppError::FlowNotPublished(_) => (StatusCode::NOT_FOUND, "flow_not_published"),
            AppError::FlowValidation(_) | AppError::InvalidInput(_) => {
                (StatusCode::BAD_REQUEST, "invalid_input")
            }
            AppError::RevisionConflict { .. } => (StatusCode::CONFLICT, "revision_conflict"),
            AppError::IdempotencyInProgress(_) => (StatusCode::ACCEPTED, "in_progress"),
            AppError::WebhookFailed(_) | AppError::ApiCallFailed(_) => {
                (StatusCode::BAD_GATEWAY, "upstream_failed")
            }
            AppError::Fatal(e) => {
                tracing::error!(error = %e, "fatal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
