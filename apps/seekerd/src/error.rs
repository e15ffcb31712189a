//! Application error types for the seekerd daemon.
//!
//! Provides a unified error type that implements `IntoResponse` for Axum.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::config::ValidationReport;
use crate::db::DbError;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Composite configuration validation failure.
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(ValidationReport),

    /// Missing share, transfer, conversation, or relay request.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credential or authentication mismatch.
    #[error("Unauthorized")]
    Unauthorized,

    /// Admission lock refused the operation.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// A remote peer declined the request; the reason is carried verbatim.
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    /// A bounded wait expired.
    #[error("Timed out: {0}")]
    TimedOut(String),

    /// Connection dropped, disk I/O failed, or a body failed to parse.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Unrecoverable startup precondition.
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Invalid request data.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Database-related errors.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// SQLite-specific errors (for direct rusqlite usage).
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration loading/parsing errors.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::TransportFailure(err.to_string())
    }
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            AppError::ConfigurationInvalid(report) => (
                StatusCode::BAD_REQUEST,
                "configuration_invalid",
                Some(report.to_string()),
            ),
            AppError::NotFound(resource) => {
                (StatusCode::NOT_FOUND, "not_found", Some(resource.clone()))
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            AppError::RateLimited(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                Some(msg.clone()),
            ),
            AppError::Rejected(reason) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "rejected",
                Some(reason.clone()),
            ),
            AppError::TimedOut(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "timed_out",
                Some(msg.clone()),
            ),
            AppError::BadRequest(msg) => {
                // Bad request messages are safe to expose (client-caused errors)
                (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone()))
            }
            AppError::TransportFailure(msg) => {
                tracing::error!("Transport failure: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "transport_failure",
                    None,
                )
            }
            AppError::Fatal(msg) => {
                tracing::error!("Fatal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "fatal", None)
            }
            AppError::Database(e) => {
                // Log full error details but don't expose to client
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::Sqlite(e) => {
                tracing::error!("SQLite error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::Config(e) => {
                tracing::error!("Config error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "configuration_error",
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers and services.
pub type Result<T> = std::result::Result<T, AppError>;
