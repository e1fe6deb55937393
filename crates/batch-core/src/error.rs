//! Unified error handling for batch-core

use thiserror::Error;

/// Core error type for batch-core.
///
/// Variants map onto the `error.type` values the HTTP API surfaces to
/// clients; the server crate's `IntoResponse` impl is the only place that
/// turns a variant into a status code and JSON body.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for batch-core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    pub fn queue_full(msg: impl Into<String>) -> Self {
        Error::QueueFull(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn state_conflict(msg: impl Into<String>) -> Self {
        Error::StateConflict(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Error::ProcessingError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// The `error.type` string the HTTP API reports for this variant.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::QueueFull(_) => "queue_full",
            Error::NotFound(_) => "not_found",
            Error::StateConflict(_) => "state_conflict",
            Error::ProcessingError(_) => "processing_error",
            Error::Database(_) | Error::Io(_) | Error::Json(_) | Error::Http(_) | Error::Internal(_) => {
                "internal_error"
            }
        }
    }
}
