//! # Error Handling
//!
//! HTTP-facing error type for the relay and its conversion into JSON responses.
//!
//! Component errors (codec, collaborator, protocol, session, turn) are `thiserror`
//! enums that live next to the code that raises them. They only become an
//! [`AppError`] when they cross an HTTP handler boundary.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **T**: The success type
//! - **E**: The error type
//! - **No exceptions**: failures travel as values and are forwarded with `?`
//!
//! ### Traits for Error Conversion
//! - **From trait**: Lets `?` convert a component error into an `AppError`
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::inference::CollaboratorError;
use crate::pipeline::dispatcher::CallError;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **NotFound**: Unknown resource, such as an expired call id (404)
/// - **Unavailable**: A collaborator is not ready, or the server is at capacity (503)
/// - **ConfigError**: Configuration problems (500)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Unavailable("too many active sessions".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource does not exist
    NotFound(String),

    /// Capacity exhausted or collaborators unavailable
    Unavailable(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl AppError {
    /// Machine-readable error type used in the JSON body.
    fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Unavailable(_) => "unavailable",
            AppError::ConfigError(_) => "config_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Unavailable(msg)
            | AppError::ConfigError(msg) => msg,
        }
    }
}

/// Converts an [`AppError`] into an HTTP response.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "unavailable",
///     "message": "too many active sessions",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// A collaborator that cannot answer makes the relay unavailable, not broken.
impl From<CollaboratorError> for AppError {
    fn from(err: CollaboratorError) -> Self {
        AppError::Unavailable(err.to_string())
    }
}

impl From<CallError> for AppError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Failed(e) => e.into(),
            CallError::Pending => AppError::Unavailable("call is still pending".to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
