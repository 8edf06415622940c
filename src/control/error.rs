//! Error types for the control API server and client.

use crate::error::ErrorKind;
use crate::pki::PkiError;
use hyper::StatusCode;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from the control API.
#[derive(Debug, Error)]
pub enum ControlError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// TLS handshake failed (including a missing or untrusted client certificate).
    #[error("TLS handshake with {peer} failed: {source}")]
    Handshake {
        /// Remote address.
        peer: SocketAddr,
        /// The underlying error.
        source: std::io::Error,
    },

    /// TLS handshake did not finish in time.
    #[error("TLS handshake with {peer} timed out")]
    HandshakeTimeout {
        /// Remote address.
        peer: SocketAddr,
    },

    /// TLS material could not be loaded.
    #[error("TLS configuration error: {0}")]
    Pki(#[from] PkiError),

    /// Server answered with a non-success status.
    #[error("Control API returned {status}: {message}")]
    Status {
        /// Response status.
        status: StatusCode,
        /// Error message from the body.
        message: String,
    },

    /// Response body was not the expected JSON.
    #[error("Invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Failed to build a request.
    #[error("Invalid request: {0}")]
    Request(String),

    /// Failed to bind the control port.
    #[error("Failed to bind control API on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl ControlError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Handshake { .. } | ControlError::HandshakeTimeout { .. } => {
                ErrorKind::AuthenticationFailure
            }
            ControlError::Pki(_) | ControlError::Bind { .. } => ErrorKind::ConfigurationError,
            ControlError::Status { status, .. } if *status == StatusCode::BAD_REQUEST => {
                ErrorKind::ValidationError
            }
            ControlError::Request(_) => ErrorKind::ValidationError,
            ControlError::Io(_)
            | ControlError::Http(_)
            | ControlError::Status { .. }
            | ControlError::Decode(_) => ErrorKind::UpstreamUnavailable,
        }
    }
}

/// Result type for control API operations.
pub type ControlResult<T> = Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_error_kinds() {
        let err = ControlError::Status {
            status: StatusCode::BAD_REQUEST,
            message: "invalid entry".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(err.to_string().contains("invalid entry"));

        let err = ControlError::HandshakeTimeout {
            peer: "127.0.0.1:1".parse().unwrap(),
        };
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }
}
