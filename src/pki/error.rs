//! Error types for credential issuance and TLS configuration.

use crate::error::ErrorKind;
use thiserror::Error;

/// Errors from generating certificates or turning PEM into TLS configs.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Failed to generate a key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to build or sign a certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// PEM input could not be parsed or contained nothing usable.
    #[error("Invalid PEM for {what}: {message}")]
    Pem {
        /// Which blob was being parsed (e.g. "server certificate").
        what: &'static str,
        /// Parser message.
        message: String,
    },

    /// rustls rejected the assembled configuration.
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl PkiError {
    /// Bad PEM or TLS material is a startup configuration problem.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigurationError
    }
}

impl From<rustls::Error> for PkiError {
    fn from(err: rustls::Error) -> Self {
        PkiError::Tls(err.to_string())
    }
}

/// Result type for PKI operations.
pub type PkiResult<T> = Result<T, PkiError>;
