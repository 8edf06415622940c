//! Configuration error types.

use crate::error::ErrorKind;
use crate::pki::PkiError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading.
///
/// Every variant is fatal: the process refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the file that couldn't be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse a JSON configuration file.
    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the file that couldn't be parsed.
        path: PathBuf,
        /// The underlying JSON parse error.
        source: serde_json::Error,
    },

    /// A configuration value is invalid.
    #[error("Invalid config value for {field}: {message}")]
    InvalidValue {
        /// The field name that has an invalid value.
        field: String,
        /// Description of why the value is invalid.
        message: String,
    },

    /// Some, but not all, TLS environment variables are set.
    #[error("Incomplete TLS material: {} not set", missing.join(", "))]
    IncompleteTls {
        /// Names of the unset variables.
        missing: Vec<&'static str>,
    },

    /// TLS material is present but unusable.
    #[error("Invalid TLS material: {0}")]
    InvalidTls(#[from] PkiError),

    /// Upstream resolver name did not resolve.
    #[error("Failed to resolve upstream '{upstream}': {message}")]
    Upstream {
        /// Configured upstream.
        upstream: String,
        /// Resolver message.
        message: String,
    },
}

impl ConfigError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigurationError
    }

    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;
