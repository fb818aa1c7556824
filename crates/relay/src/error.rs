//! Error types for the relay.

use axum::http::StatusCode;
use thiserror::Error;

/// Main error type for the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Caller input failed validation (missing tool name, malformed arguments)
    #[error("{0}")]
    InvalidRequest(String),

    /// The provider link is not established and could not be established
    #[error("{0}")]
    NotConnected(String),

    /// The provider rejected or failed the operation; message is passed through verbatim
    #[error("{0}")]
    Provider(String),

    /// Writing to a streaming channel failed (peer vanished)
    #[error("Stream transport error: {0}")]
    Transport(String),

    /// Configuration errors (invalid YAML, missing or conflicting provider settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Startup errors (listener bind failures)
    #[error("Startup error: {0}")]
    Startup(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RelayError {
    /// HTTP status used when this error reaches a request handler.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
