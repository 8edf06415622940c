//! rustls configuration for the mutually authenticated control channel.
//!
//! Both sides pin TLS 1.3 and trust only the supplied CA. The server refuses
//! any handshake that does not present a client certificate chaining to that
//! CA, so unauthenticated peers never reach HTTP request handling.

use super::error::{PkiError, PkiResult};
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::sync::Arc;

/// Server name every control API client verifies against.
pub const CONTROL_SERVER_NAME: &str = "localhost";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Parse every certificate in a PEM blob. An empty result is an error.
pub fn parse_certificates(pem: &str, what: &'static str) -> PkiResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PkiError::Pem {
            what,
            message: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(PkiError::Pem {
            what,
            message: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Parse the first private key in a PEM blob.
pub fn parse_private_key(pem: &str, what: &'static str) -> PkiResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| PkiError::Pem {
            what,
            message: e.to_string(),
        })?
        .ok_or_else(|| PkiError::Pem {
            what,
            message: "no private key found".to_string(),
        })
}

fn root_store(ca_pem: &str) -> PkiResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(ca_pem, "CA certificate")? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Build the control API server config: TLS 1.3, client certificate required.
pub fn mtls_server_config(cert_pem: &str, key_pem: &str, ca_pem: &str) -> PkiResult<Arc<ServerConfig>> {
    let certs = parse_certificates(cert_pem, "server certificate")?;
    let key = parse_private_key(key_pem, "server key")?;
    let roots = Arc::new(root_store(ca_pem)?);

    let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
        .build()
        .map_err(|e| PkiError::Tls(format!("client verifier: {}", e)))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Build a control API client config presenting `cert_pem` and trusting only `ca_pem`.
pub fn mtls_client_config(cert_pem: &str, key_pem: &str, ca_pem: &str) -> PkiResult<Arc<ClientConfig>> {
    let certs = parse_certificates(cert_pem, "client certificate")?;
    let key = parse_private_key(key_pem, "client key")?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(root_store(ca_pem)?)
        .with_client_auth_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// The server name clients should pass to the TLS connector.
pub fn control_server_name() -> ServerName<'static> {
    ServerName::try_from(CONTROL_SERVER_NAME)
        .map(|n| n.to_owned())
        .unwrap_or_else(|_| ServerName::IpAddress(std::net::Ipv4Addr::LOCALHOST.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_certificates_rejects_empty() {
        let err = parse_certificates("", "CA certificate").unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }

    #[test]
    fn test_parse_private_key_rejects_cert_only_pem() {
        let creds = crate::pki::CredentialSet::generate(std::time::Duration::from_secs(60)).unwrap();
        assert!(parse_private_key(creds.server_cert_pem(), "server key").is_err());
        assert!(parse_private_key(creds.server_key_pem(), "server key").is_ok());
    }

    #[test]
    fn test_configs_build_from_generated_material() {
        let creds = crate::pki::CredentialSet::generate(std::time::Duration::from_secs(60)).unwrap();
        mtls_server_config(creds.server_cert_pem(), creds.server_key_pem(), creds.ca_cert_pem()).unwrap();
        mtls_client_config(creds.client_cert_pem(), creds.client_key_pem(), creds.ca_cert_pem()).unwrap();
    }

    #[test]
    fn test_control_server_name() {
        assert!(matches!(control_server_name(), ServerName::DnsName(_)));
    }
}
