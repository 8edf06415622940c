//! Error classification shared by every listener.
//!
//! Each module keeps its own `thiserror` enum; those enums map onto one of
//! the [`ErrorKind`] categories so callers can decide how a failure is
//! surfaced (status code, DNS rcode, TLS rejection, or process exit).

use serde::Serialize;
use std::fmt;

/// Category of a failure, independent of which module produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Destination or query name is not on the allowlist (403 / REFUSED).
    PolicyDenied,
    /// Malformed allowlist entry or request body (400, store unchanged).
    ValidationError,
    /// Upstream dial, resolve, or exchange failed or timed out (5xx / SERVFAIL).
    UpstreamUnavailable,
    /// Control API peer presented no valid client certificate.
    AuthenticationFailure,
    /// Startup configuration or TLS material is unusable.
    ConfigurationError,
}

impl ErrorKind {
    /// Whether this kind of failure must stop the process.
    ///
    /// Everything except configuration errors stays contained to the
    /// connection that produced it.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::ConfigurationError)
    }

    /// Stable snake_case name, used in logs and JSON error bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PolicyDenied => "policy_denied",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::AuthenticationFailure => "authentication_failure",
            ErrorKind::ConfigurationError => "configuration_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
