//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.
//!
//! Engine errors carry no internal details, so their messages are passed to
//! the client directly; unclassified internal errors are logged in full and
//! surfaced generically.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use marathon_core::EngineError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// All errors that can occur in the marathon-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the orchestration engine.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),

            ServerError::Engine(e) => match e {
                EngineError::InvalidDefinition(m) => (
                    StatusCode::BAD_REQUEST,
                    format!("invalid task definition: {m}"),
                ),
                EngineError::NotFound { task_id } => {
                    (StatusCode::NOT_FOUND, format!("task {task_id} not found"))
                }
                EngineError::NotRecoverable { reason } => (
                    StatusCode::CONFLICT,
                    format!("task not recoverable: {reason}"),
                ),
                EngineError::TaskStillActive { task_id, status } => (
                    StatusCode::CONFLICT,
                    format!("task {task_id} is still active (status {status})"),
                ),
                EngineError::QueueFull { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "engine queue is full; retry shortly".to_owned(),
                ),
                EngineError::EngineShutdown => {
                    error!("engine command loop is gone");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_owned(),
                    )
                }
            },

            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn engine_errors_map_to_expected_status_codes() {
        let cases = [
            (
                ServerError::Engine(EngineError::InvalidDefinition("empty".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServerError::Engine(EngineError::NotRecoverable {
                    reason: "no checkpoint".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                ServerError::Engine(EngineError::QueueFull { capacity: 64 }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ServerError::NotFound("task x not found".into()),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
