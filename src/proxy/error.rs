//! Error types for the HTTP forward proxy.
//!
//! Every per-request failure maps to a status code returned to the sandboxed
//! client; none of them stop the listener.

use crate::error::ErrorKind;
use hyper::StatusCode;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Malformed request line or target.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Destination is not on the HTTP allowlist.
    #[error("{host}:{port} is not in the allowlist")]
    Denied {
        /// Requested host.
        host: String,
        /// Requested port.
        port: u16,
    },

    /// Destination resolved into a blocked address range.
    #[error("{host} resolves to blocked address {addr}")]
    BlockedAddress {
        /// Requested host.
        host: String,
        /// The offending address.
        addr: IpAddr,
    },

    /// Host name could not be resolved.
    #[error("Failed to resolve '{host}': {message}")]
    Resolve {
        /// Requested host.
        host: String,
        /// Resolver message.
        message: String,
    },

    /// Dial did not complete in time.
    #[error("Timed out connecting to '{addr}'")]
    Timeout {
        /// The address we tried to connect to.
        addr: String,
    },

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// Upgrade to tunnel failed.
    #[error("HTTP upgrade failed: {0}")]
    UpgradeFailed(String),

    /// Failed to bind the proxy port.
    #[error("Failed to bind proxy listener on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl ProxyError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Denied { .. } | ProxyError::BlockedAddress { .. } => ErrorKind::PolicyDenied,
            ProxyError::BadRequest(_) => ErrorKind::ValidationError,
            ProxyError::Bind { .. } => ErrorKind::ConfigurationError,
            ProxyError::Io(_)
            | ProxyError::Http(_)
            | ProxyError::Resolve { .. }
            | ProxyError::Timeout { .. }
            | ProxyError::UpstreamConnect { .. }
            | ProxyError::UpgradeFailed(_) => ErrorKind::UpstreamUnavailable,
        }
    }

    /// Whether this is the peer going away rather than a fault worth a warning.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => is_disconnect_io(e),
            ProxyError::Http(e) => {
                e.is_incomplete_message()
                    || e.is_canceled()
                    || e.is_closed()
                    || io_source(e).is_some_and(is_disconnect_io)
            }
            _ => false,
        }
    }

    /// Status code reported to the proxy client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Denied { .. } | ProxyError::BlockedAddress { .. } => StatusCode::FORBIDDEN,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

fn is_disconnect_io(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// The I/O error at the root of a hyper error, if any.
fn io_source(e: &hyper::Error) -> Option<&std::io::Error> {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = err.source();
    }
    None
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::BadRequest("missing authority".to_string());
        assert!(err.to_string().contains("missing authority"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_denied_maps_to_forbidden() {
        let err = ProxyError::Denied {
            host: "evil.example".to_string(),
            port: 443,
        };
        assert_eq!(err.to_string(), "evil.example:443 is not in the allowlist");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.kind(), ErrorKind::PolicyDenied);
    }

    #[test]
    fn test_upstream_errors() {
        let timeout = ProxyError::Timeout {
            addr: "api.example.com:443".to_string(),
        };
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let refused = ProxyError::UpstreamConnect {
            addr: "api.example.com:443".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(refused.to_string().contains("connection refused"));
        assert_eq!(refused.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(refused.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
    }

    #[test]
    fn test_disconnects_classified_by_kind() {
        use std::io::{Error, ErrorKind as IoKind};

        for kind in [IoKind::ConnectionReset, IoKind::BrokenPipe, IoKind::UnexpectedEof] {
            assert!(ProxyError::Io(Error::from(kind)).is_disconnect(), "{:?}", kind);
        }
        // Message text alone does not make it a disconnect
        let other = Error::other("connection reset by peer");
        assert!(!ProxyError::Io(other).is_disconnect());
        assert!(!ProxyError::BadRequest("broken pipe".into()).is_disconnect());
    }
}
