/// Unified error types for Shutterhub
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the coordination layer
#[derive(Error, Debug)]
pub enum HubError {
    /// Bad input rejected before any network call
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced entity is absent from the record store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness or state guard violated
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Backing service unreachable or timed out
    #[error("Store unavailable: {0}")]
    Transport(String),

    /// Missing or invalid operator credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller aborted the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Database errors not mapped to a more specific kind
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Row (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Whether a human may reasonably retry the same call later.
    pub fn is_transient(&self) -> bool {
        matches!(self, HubError::Transport(_) | HubError::Io(_))
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::Validation(_) => "validation",
            HubError::NotFound(_) => "not_found",
            HubError::Constraint(_) => "constraint",
            HubError::Transport(_) => "transport",
            HubError::Unauthorized(_) => "unauthorized",
            HubError::Cancelled => "cancelled",
            HubError::Database(_) => "database",
            HubError::Io(_) => "io",
            HubError::Serialization(_) => "serialization",
            HubError::Internal(_) => "internal",
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert HubError to HTTP response
impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        crate::metrics::record_error(self.kind(), "api");

        let (status, error_code, message) = match self {
            HubError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                self.to_string(),
            ),
            HubError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", self.to_string()),
            HubError::Constraint(_) => (StatusCode::CONFLICT, "Conflict", self.to_string()),
            HubError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                "AuthenticationRequired",
                self.to_string(),
            ),
            HubError::Transport(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "ServiceUnavailable",
                "The service is temporarily unavailable, please retry".to_string(),
            ),
            HubError::Cancelled => (
                StatusCode::BAD_REQUEST,
                "Cancelled",
                "Request was cancelled".to_string(),
            ),
            HubError::Database(_)
            | HubError::Io(_)
            | HubError::Serialization(_)
            | HubError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for coordination operations
pub type HubResult<T> = Result<T, HubError>;
