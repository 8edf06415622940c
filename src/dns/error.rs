//! Error types for the DNS listener.

use crate::error::ErrorKind;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised while parsing, answering or forwarding DNS messages.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Message could not be parsed.
    #[error("Malformed DNS message: {0}")]
    Malformed(&'static str),

    /// I/O error on a client or upstream socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Upstream did not answer in time.
    #[error("Upstream resolver {upstream} timed out")]
    Timeout {
        /// Upstream resolver address.
        upstream: SocketAddr,
    },

    /// Upstream answer did not match the query.
    #[error("Upstream resolver {upstream} sent a mismatched reply")]
    Mismatch {
        /// Upstream resolver address.
        upstream: SocketAddr,
    },

    /// Failed to bind the DNS port.
    #[error("Failed to bind DNS listener on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl DnsError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DnsError::Malformed(_) => ErrorKind::ValidationError,
            DnsError::Bind { .. } => ErrorKind::ConfigurationError,
            DnsError::Io(_) | DnsError::Timeout { .. } | DnsError::Mismatch { .. } => {
                ErrorKind::UpstreamUnavailable
            }
        }
    }
}

/// Result type for DNS operations.
pub type DnsResult<T> = Result<T, DnsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_error_kinds() {
        assert_eq!(DnsError::Malformed("x").kind(), ErrorKind::ValidationError);
        let timeout = DnsError::Timeout {
            upstream: "9.9.9.9:53".parse().unwrap(),
        };
        assert_eq!(timeout.kind(), ErrorKind::UpstreamUnavailable);
        assert!(timeout.to_string().contains("9.9.9.9:53"));
    }
}
