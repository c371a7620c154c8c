//! # Error Handling
//!
//! Two error families live here:
//!
//! - **AppError**: failures at the HTTP boundary, converted into JSON error
//!   responses before any transcription starts (bad input, auth problems).
//! - **StreamError**: failures inside a transcription stream. These never
//!   become HTTP errors; the streamer turns each one into a single terminal
//!   `error` event.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "unauthorized",
//!     "message": "Missing or invalid bearer token",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;

/// Boundary errors returned by HTTP handlers and middleware.
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Shared secret missing or wrong
    Unauthorized(String),

    /// Authentication is required but no secret is configured
    AuthMisconfigured(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::AuthMisconfigured(msg) => write!(f, "Authentication misconfigured: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            AppError::AuthMisconfigured(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "auth_misconfigured", msg)
            }
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

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

pub type AppResult<T> = Result<T, AppError>;

/// Failures that end a transcription stream.
///
/// The `Display` text is exactly what the client receives in the terminal
/// `error` event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamError {
    /// The audio path does not exist.
    InputNotFound(PathBuf),

    /// The client went away; detected between segments.
    ClientDisconnected,

    /// Building the model failed. The manager stays unloaded.
    ModelLoad(String),

    /// The inference call (or audio decoding) failed.
    Inference(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::InputNotFound(path) => {
                write!(f, "Audio file not found: {}", path.display())
            }
            StreamError::ClientDisconnected => write!(f, "Client disconnected"),
            StreamError::ModelLoad(msg) => write!(f, "Failed to load model: {}", msg),
            StreamError::Inference(msg) => write!(f, "Transcription failed: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

impl StreamError {
    pub fn model_load(err: anyhow::Error) -> Self {
        StreamError::ModelLoad(format!("{:#}", err))
    }

    pub fn inference(err: anyhow::Error) -> Self {
        StreamError::Inference(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Unauthorized("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::AuthMisconfigured("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_stream_error_messages() {
        let missing = StreamError::InputNotFound(PathBuf::from("missing.wav"));
        assert_eq!(missing.to_string(), "Audio file not found: missing.wav");
        assert_eq!(
            StreamError::ClientDisconnected.to_string(),
            "Client disconnected"
        );
        let load = StreamError::model_load(anyhow::anyhow!("no weights"));
        assert_eq!(load.to_string(), "Failed to load model: no weights");
    }
}
