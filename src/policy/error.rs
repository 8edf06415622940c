//! Error types for allowlist and address policy.

use crate::error::ErrorKind;
use thiserror::Error;

/// Errors produced while validating policy input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// An HTTP allowlist entry is not a valid `host:port`.
    #[error("invalid HTTP allowlist entry {entry:?}: {reason}")]
    InvalidHttpEntry {
        /// The entry as submitted.
        entry: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A DNS allowlist entry is not a bare hostname.
    #[error("invalid DNS allowlist entry {entry:?}: {reason}")]
    InvalidDnsEntry {
        /// The entry as submitted.
        entry: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A blocked range is not valid CIDR notation.
    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),
}

impl PolicyError {
    /// Classify this error. All policy input errors are validation failures.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ValidationError
    }
}

/// Result type for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_error_display() {
        let err = PolicyError::InvalidHttpEntry {
            entry: "example.com".to_string(),
            reason: "missing port",
        };
        assert!(err.to_string().contains("\"example.com\""));
        assert!(err.to_string().contains("missing port"));
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }
}
