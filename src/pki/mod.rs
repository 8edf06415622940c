//! Ephemeral PKI for the control API.
//!
//! - [`CredentialSet`]: CA, server and client certificates held in memory
//! - [`tls`]: PEM parsing and TLS 1.3 mTLS configs for both ends

pub mod credentials;
pub mod error;
pub mod tls;

pub use credentials::CredentialSet;
pub use error::{PkiError, PkiResult};
pub use tls::{mtls_client_config, mtls_server_config};

/// Issue a fresh credential set valid for `validity`.
pub fn generate_credentials(validity: std::time::Duration) -> PkiResult<CredentialSet> {
    CredentialSet::generate(validity)
}
