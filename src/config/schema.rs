//! Configuration schema definitions.
//!
//! The proxy reads a single JSON document. Keys are kebab-case; the
//! PascalCase spellings used by older launchers (`AllowHTTP`, `DNSPort`,
//! ...) are accepted as aliases. Every field is optional.
//!
//! ```json
//! {
//!   "allow-http": ["api.example.com:443", "*.cdn.example.com:443"],
//!   "allow-dns": ["api.example.com"],
//!   "upstream": "9.9.9.9:53",
//!   "proxy-port": 3128,
//!   "control-api-port": 3129,
//!   "dns-port": 53
//! }
//! ```

use super::error::{ConfigError, ConfigResult};
use crate::policy::{CidrBlocker, DnsEntry, HttpEntry};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default upstream resolver.
pub const DEFAULT_UPSTREAM: &str = "9.9.9.9:53";
/// Default HTTP proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 3128;
/// Default control API port.
pub const DEFAULT_CONTROL_API_PORT: u16 = 3129;
/// Default DNS port.
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Top-level proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProxyConfig {
    /// Initial HTTP allowlist (`host:port`).
    #[serde(alias = "AllowHTTP")]
    pub allow_http: Vec<String>,

    /// Initial DNS allowlist (bare names).
    #[serde(alias = "AllowDNS")]
    pub allow_dns: Vec<String>,

    /// Extra address ranges to refuse, on top of the private defaults.
    #[serde(alias = "BlockCIDR")]
    pub block_cidr: Vec<String>,

    /// Upstream DNS resolver (`host:port`).
    #[serde(alias = "Upstream")]
    pub upstream: String,

    /// Address every listener binds to.
    #[serde(alias = "Bind")]
    pub bind: IpAddr,

    /// HTTP proxy port.
    #[serde(alias = "ProxyPort")]
    pub proxy_port: u16,

    /// mTLS control API port.
    #[serde(alias = "ControlAPIPort")]
    pub control_api_port: u16,

    /// DNS port (UDP and TCP).
    #[serde(alias = "DNSPort")]
    pub dns_port: u16,

    /// Telemetry ingest port. Ingest is disabled when unset.
    #[serde(alias = "TelemetryPort", skip_serializing_if = "Option::is_none")]
    pub telemetry_port: Option<u16>,

    /// Address the sandbox reaches this proxy on. Used to answer DNS
    /// queries for the host-gateway alias.
    #[serde(alias = "ProxyIP", skip_serializing_if = "Option::is_none")]
    pub proxy_ip: Option<Ipv4Addr>,

    /// Address of the container host, target of the host-gateway alias.
    #[serde(alias = "HostGateway", skip_serializing_if = "Option::is_none")]
    pub host_gateway: Option<IpAddr>,

    /// Host ports reachable through the host-gateway alias.
    #[serde(alias = "AllowHostPorts")]
    pub allow_host_ports: Vec<u16>,

    /// Deadline for resolving and connecting to HTTP upstreams.
    #[serde(alias = "DialTimeoutSecs")]
    pub dial_timeout_secs: u64,

    /// Deadline for upstream DNS exchanges.
    #[serde(alias = "DNSTimeoutSecs")]
    pub dns_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allow_http: Vec::new(),
            allow_dns: Vec::new(),
            block_cidr: Vec::new(),
            upstream: DEFAULT_UPSTREAM.to_string(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            proxy_port: DEFAULT_PROXY_PORT,
            control_api_port: DEFAULT_CONTROL_API_PORT,
            dns_port: DEFAULT_DNS_PORT,
            telemetry_port: None,
            proxy_ip: None,
            host_gateway: None,
            allow_host_ports: Vec::new(),
            dial_timeout_secs: 10,
            dns_timeout_secs: 5,
        }
    }
}

impl ProxyConfig {
    /// Check every value that would otherwise fail later at startup.
    pub fn validate(&self) -> ConfigResult<()> {
        for entry in &self.allow_http {
            HttpEntry::parse(entry).map_err(|e| ConfigError::invalid("allow-http", e.to_string()))?;
        }
        for entry in &self.allow_dns {
            DnsEntry::parse(entry).map_err(|e| ConfigError::invalid("allow-dns", e.to_string()))?;
        }
        self.blocker()?;
        self.upstream_parts()?;

        if self.dial_timeout_secs == 0 {
            return Err(ConfigError::invalid("dial-timeout-secs", "must be greater than 0"));
        }
        if self.dns_timeout_secs == 0 {
            return Err(ConfigError::invalid("dns-timeout-secs", "must be greater than 0"));
        }
        if !self.allow_host_ports.is_empty() && self.host_gateway.is_none() {
            return Err(ConfigError::invalid(
                "allow-host-ports",
                "requires host-gateway to be set",
            ));
        }
        if self.allow_host_ports.contains(&0) {
            return Err(ConfigError::invalid("allow-host-ports", "port 0 is not valid"));
        }
        Ok(())
    }

    /// Blocked ranges: the private defaults plus `block-cidr`.
    pub fn blocker(&self) -> ConfigResult<CidrBlocker> {
        CidrBlocker::with_defaults(&self.block_cidr)
            .map_err(|e| ConfigError::invalid("block-cidr", e.to_string()))
    }

    /// Split `upstream` into host and port.
    pub fn upstream_parts(&self) -> ConfigResult<(&str, u16)> {
        let invalid = || ConfigError::invalid("upstream", format!("'{}' is not host:port", self.upstream));
        let (host, port) = self.upstream.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }
        Ok((host, port))
    }

    /// Resolve the upstream resolver to a socket address.
    pub async fn resolve_upstream(&self) -> ConfigResult<SocketAddr> {
        let (host, port) = self.upstream_parts()?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let upstream_error = |message: String| ConfigError::Upstream {
            upstream: self.upstream.clone(),
            message,
        };
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| upstream_error(e.to_string()))?
            .next()
            .ok_or_else(|| upstream_error("no addresses".to_string()))
    }

    /// HTTP dial deadline.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Upstream DNS deadline.
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    /// Address for a listener on `port`.
    pub fn listen_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind, port)
    }
}
