//! Ephemeral certificate authority and mTLS credential issuance.
//!
//! [`CredentialSet::generate`] creates a fresh self-signed CA, signs one
//! server certificate (for the control API listener) and one client
//! certificate (for the operator), then drops the CA private key. Nothing is
//! written to disk; collaborators receive the material as PEM text.
//!
//! # Security Model
//!
//! - A new CA per run, so a leaked key is useless after the process exits
//! - The CA key never leaves [`CredentialSet::generate`], so no further
//!   certificates can be minted from an existing set
//! - Server and client certificates carry distinct extended key usages and
//!   share the caller's validity window, which is never renewed
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::pki::CredentialSet;
//! use std::time::Duration;
//!
//! let creds = CredentialSet::generate(Duration::from_secs(30 * 24 * 3600))?;
//! let client = creds.client_tls_config()?;
//! std::env::set_var("EGRESS_PROXY_TLS_CERT", creds.server_cert_pem());
//! ```

use super::error::{PkiError, PkiResult};
use super::tls::{CONTROL_SERVER_NAME, mtls_client_config, mtls_server_config};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::{ClientConfig, ServerConfig};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};

const ORGANIZATION: &str = "egress-warden";

/// One CA certificate plus the server and client leaves it signed.
pub struct CredentialSet {
    ca_cert_pem: String,
    server_cert_pem: String,
    server_key_pem: String,
    client_cert_pem: String,
    client_key_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl CredentialSet {
    /// Issue a new CA, server and client certificate valid from now for `validity`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `validity` is zero or does not fit a certificate date
    /// - Key generation fails
    /// - Signing fails
    pub fn generate(validity: std::time::Duration) -> PkiResult<Self> {
        let validity = time::Duration::try_from(validity)
            .ok()
            .filter(|v| v.is_positive())
            .ok_or_else(|| PkiError::CertGeneration("validity must be positive".to_string()))?;

        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before
            .checked_add(validity)
            .ok_or_else(|| PkiError::CertGeneration("validity overflows".to_string()))?;

        info!("Generating ephemeral CA, certificates expire at {}", not_after);

        let ca_key = new_key()?;
        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = distinguished_name("egress-warden Ephemeral CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        ca_params.not_before = not_before;
        ca_params.not_after = not_after;

        let ca_cert = ca_params
            .clone()
            .self_signed(&ca_key)
            .map_err(|e| PkiError::CertGeneration(e.to_string()))?;
        let issuer = Issuer::from_params(&ca_params, &ca_key);

        let server_key = new_key()?;
        let mut server_params = leaf_params("egress-warden control API", not_before, not_after);
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        server_params.subject_alt_names = vec![
            SanType::DnsName(
                CONTROL_SERVER_NAME
                    .try_into()
                    .map_err(|e: rcgen::Error| PkiError::CertGeneration(e.to_string()))?,
            ),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ];
        let server_cert = server_params
            .signed_by(&server_key, &issuer)
            .map_err(|e| PkiError::CertGeneration(e.to_string()))?;

        let client_key = new_key()?;
        let mut client_params = leaf_params("egress-warden operator", not_before, not_after);
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_cert = client_params
            .signed_by(&client_key, &issuer)
            .map_err(|e| PkiError::CertGeneration(e.to_string()))?;

        debug!("Issued control API server and client certificates");

        Ok(Self {
            ca_cert_pem: ca_cert.pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
            client_cert_pem: client_cert.pem(),
            client_key_pem: client_key.serialize_pem(),
            not_before,
            not_after,
        })
    }

    /// CA certificate (PEM). The CA key is not retained.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Control API server certificate (PEM).
    pub fn server_cert_pem(&self) -> &str {
        &self.server_cert_pem
    }

    /// Control API server private key (PEM).
    pub fn server_key_pem(&self) -> &str {
        &self.server_key_pem
    }

    /// Operator client certificate (PEM).
    pub fn client_cert_pem(&self) -> &str {
        &self.client_cert_pem
    }

    /// Operator client private key (PEM).
    pub fn client_key_pem(&self) -> &str {
        &self.client_key_pem
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Server-side rustls config requiring a client certificate from this CA.
    pub fn server_tls_config(&self) -> PkiResult<Arc<ServerConfig>> {
        mtls_server_config(&self.server_cert_pem, &self.server_key_pem, &self.ca_cert_pem)
    }

    /// Client-side rustls config that presents the operator certificate and
    /// trusts only this CA.
    pub fn client_tls_config(&self) -> PkiResult<Arc<ClientConfig>> {
        mtls_client_config(&self.client_cert_pem, &self.client_key_pem, &self.ca_cert_pem)
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn new_key() -> PkiResult<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| PkiError::KeyGeneration(e.to_string()))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

fn leaf_params(
    common_name: &str,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.not_before = not_before;
    params.not_after = not_after;
    params
}
