//! Telemetry error types.

use crate::error::ErrorKind;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from the telemetry ingest listener.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to bind the ingest port.
    #[error("Failed to bind telemetry listener on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// I/O error on an accepted connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl TelemetryError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TelemetryError::Bind { .. } => ErrorKind::ConfigurationError,
            TelemetryError::Io(_) | TelemetryError::Http(_) => ErrorKind::UpstreamUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_is_fatal() {
        let err = TelemetryError::Bind {
            addr: "127.0.0.1:4318".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("127.0.0.1:4318"));
        assert!(err.kind().is_fatal());
    }
}
