//! Error taxonomy for the relay core.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Why a pending request was resolved without a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Deadline passed before a response arrived
    Timeout,
    /// The tunnel connection went away
    ConnectionClosed,
    /// A newer connection registered for the same identifier
    Superseded,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::ConnectionClosed => f.write_str("connection closed"),
            FailureReason::Superseded => f.write_str("superseded"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// Should be unreachable with UUID correlation IDs
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(String),

    #[error("session is shutting down ({0})")]
    Closed(FailureReason),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    SessionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Transport-level failure reported by a frame stream or sink
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<axum::Error> for TransportError {
    fn from(e: axum::Error) -> Self {
        TransportError(e.to_string())
    }
}

/// Errors returned to the HTTP layer by the dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("private server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("private server did not respond within {0:?}")]
    RequestTimeout(Duration),

    #[error("failed to send request to private server: {0}")]
    SendFailed(String),

    #[error("private server returned invalid status {0}")]
    InvalidStatus(u16),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::ServerUnavailable(_) => StatusCode::BAD_GATEWAY,
            DispatchError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::SendFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::InvalidStatus(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            DispatchError::ServerUnavailable("srv1".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            DispatchError::RequestTimeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            DispatchError::SendFailed("broken pipe".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
