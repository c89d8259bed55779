//! Unified error handling for the server.

use crate::runner::RunError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Engine error: {0}")]
    Engine(#[from] converge_engine::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Run(e) => {
                tracing::warn!("Run error: {}", e);
                let status = match e {
                    RunError::InvalidRequest(_) | RunError::UnknownOrigin(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    RunError::FetchFailure { .. } => StatusCode::BAD_GATEWAY,
                    RunError::AmbiguousSource { .. } => StatusCode::CONFLICT,
                    RunError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string(), None)
            }
            AppError::Engine(e) => {
                tracing::error!("Engine error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Engine error".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
