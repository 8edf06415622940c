//! Configuration loading.
//!
//! Two sources feed the proxy at startup:
//!
//! 1. The JSON config file (via `--config`); defaults when omitted
//! 2. TLS material for the control API, from environment variables
//!
//! Both are validated before any listener is bound. Anything wrong is a
//! [`ConfigError`] and the process refuses to start.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use tracing::{debug, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::ProxyConfig;
use crate::pki::mtls_server_config;

/// Environment variable holding the control API server key (PEM).
pub const TLS_KEY_ENV: &str = "EGRESS_PROXY_TLS_KEY";

/// Environment variable holding the control API server certificate (PEM).
pub const TLS_CERT_ENV: &str = "EGRESS_PROXY_TLS_CERT";

/// Environment variable holding the CA that signs client certificates (PEM).
pub const CA_CERT_ENV: &str = "EGRESS_PROXY_CA_CERT";

/// Configuration loader.
#[derive(Debug, Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Create a new loader.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Load and validate configuration.
    ///
    /// With no path, the built-in defaults are used. A path that does not
    /// exist is an error.
    pub fn load(&self, path: Option<&Path>) -> ConfigResult<ProxyConfig> {
        let config = match path {
            Some(path) => {
                let config = self.load_file(path)?;
                debug!("Loaded config from {:?}", path);
                config
            }
            None => {
                debug!("No config file given, using defaults");
                ProxyConfig::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file without validating it.
    pub fn load_file(&self, path: &Path) -> ConfigResult<ProxyConfig> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// PEM material for the control API.
#[derive(Clone)]
pub struct TlsMaterial {
    /// Server certificate.
    pub cert_pem: String,
    /// Server private key.
    pub key_pem: String,
    /// CA that client certificates must chain to.
    pub ca_pem: String,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .field("ca_pem", &format_args!("{} bytes", self.ca_pem.len()))
            .finish()
    }
}

impl TlsMaterial {
    /// Read TLS material from the process environment.
    ///
    /// Returns `Ok(None)` when none of the variables are set.
    pub fn from_env() -> ConfigResult<Option<Self>> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read TLS material through `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Option<Self>> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let key = get(TLS_KEY_ENV);
        let cert = get(TLS_CERT_ENV);
        let ca = get(CA_CERT_ENV);

        match (key, cert, ca) {
            (Some(key_pem), Some(cert_pem), Some(ca_pem)) => Ok(Some(Self {
                cert_pem,
                key_pem,
                ca_pem,
            })),
            (None, None, None) => {
                warn!(
                    "{}, {} and {} not set; control API disabled",
                    TLS_KEY_ENV, TLS_CERT_ENV, CA_CERT_ENV
                );
                Ok(None)
            }
            (key, cert, ca) => {
                let missing = [(TLS_KEY_ENV, key.is_none()), (TLS_CERT_ENV, cert.is_none()), (CA_CERT_ENV, ca.is_none())]
                    .into_iter()
                    .filter_map(|(name, absent)| absent.then_some(name))
                    .collect();
                Err(ConfigError::IncompleteTls { missing })
            }
        }
    }

    /// Build the mTLS server configuration.
    pub fn server_config(&self) -> ConfigResult<Arc<ServerConfig>> {
        Ok(mtls_server_config(&self.cert_pem, &self.key_pem, &self.ca_pem)?)
    }
}
