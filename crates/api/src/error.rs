//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use clubkit_settlement::SettlementError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource conflict: {0}")]
    Conflict(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Internal details never reach callers
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        match err {
            // Malformed business input: the gateway must not retry
            SettlementError::Validation(msg) => ApiError::Validation(msg),
            SettlementError::NotFound(_) => ApiError::NotFound,
            // Transient store failures are retryable, so 5xx keeps the
            // gateway's retry loop alive
            SettlementError::TransientStore(msg) => {
                tracing::warn!(error = %msg, "Transient store error during request");
                ApiError::ServiceUnavailable
            }
            // Invariant violations are logged loudly and surface as opaque
            // server errors; the event stays queued for manual review
            SettlementError::InvariantViolation(msg) => {
                tracing::error!(error = %msg, "Invariant violation during request");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
