//! Error types for the relay.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying messages.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Log backend error: {0}")]
    Backend(String),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            RelayError::BadRequest(_) | RelayError::Protocol(_) | RelayError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            RelayError::Backend(_) | RelayError::TransportClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}
