//! Policy-checked upstream connections.
//!
//! Both request shapes (plain and CONNECT) go through
//! [`ProxyContext::connect_upstream`], which:
//! 1. Routes the reserved host-gateway alias, if configured
//! 2. Checks the HTTP allowlist and refuses before any resolution or dial
//! 3. Resolves the host and refuses if any address is in a blocked range
//! 4. Dials with a deadline covering resolution and connect
//!
//! Each decision is written to the audit log.

use super::error::{ProxyError, ProxyResult};
use crate::audit::{Action, AuditLog, Reason, Source};
use crate::policy::{AllowListStore, CidrBlocker, allowlist::normalize_host};
use crate::shutdown::ShutdownRx;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Reserved name the sandbox uses to reach services on the container host.
pub const HOST_GATEWAY_ALIAS: &str = "host.internal";

/// Default deadline for resolving and connecting to an upstream.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Route for [`HOST_GATEWAY_ALIAS`].
#[derive(Debug, Clone)]
pub struct HostGateway {
    /// Address the alias is rewritten to.
    pub addr: IpAddr,
    /// Host ports the sandbox may reach through the alias.
    pub ports: Vec<u16>,
}

/// Resolves and dials upstream addresses with a deadline.
#[derive(Debug, Clone)]
pub struct Dialer {
    blocker: CidrBlocker,
    timeout: Duration,
}

impl Dialer {
    /// Create a dialer refusing addresses in `blocker` and giving up after `timeout`.
    pub fn new(blocker: CidrBlocker, timeout: Duration) -> Self {
        Self { blocker, timeout }
    }

    /// Resolve `host`, refuse blocked addresses, then connect to the first
    /// address that accepts.
    pub async fn dial(&self, host: &str, port: u16) -> ProxyResult<TcpStream> {
        let target = format!("{}:{}", host, port);
        tokio::time::timeout(self.timeout, async {
            let addrs = self.resolve(host, port).await?;
            if let Some(blocked) = addrs.iter().find(|a| self.blocker.is_blocked(a.ip())) {
                return Err(ProxyError::BlockedAddress {
                    host: host.to_string(),
                    addr: blocked.ip(),
                });
            }
            connect_any(&target, &addrs).await
        })
        .await
        .map_err(|_| ProxyError::Timeout { addr: target.clone() })?
    }

    /// Connect to a fixed address without resolution or range checks.
    pub async fn dial_addr(&self, addr: SocketAddr) -> ProxyResult<TcpStream> {
        let target = addr.to_string();
        tokio::time::timeout(self.timeout, connect_any(&target, &[addr]))
            .await
            .map_err(|_| ProxyError::Timeout { addr: target.clone() })?
    }

    async fn resolve(&self, host: &str, port: u16) -> ProxyResult<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ProxyError::Resolve {
                host: host.to_string(),
                message: e.to_string(),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ProxyError::Resolve {
                host: host.to_string(),
                message: "no addresses".to_string(),
            });
        }
        Ok(addrs)
    }
}

async fn connect_any(target: &str, addrs: &[SocketAddr]) -> ProxyResult<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("Connected to upstream {} ({})", target, addr);
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(ProxyError::UpstreamConnect {
        addr: target.to_string(),
        message: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses".to_string()),
    })
}

/// State shared by every proxy connection.
pub struct ProxyContext {
    /// HTTP allowlist.
    pub allowlist: Arc<AllowListStore>,
    /// Decision log.
    pub audit: Arc<AuditLog>,
    /// Upstream dialer.
    pub dialer: Dialer,
    /// Optional host-gateway route.
    pub host_gateway: Option<HostGateway>,
    /// Shutdown signal, watched by tunnels.
    pub shutdown_rx: ShutdownRx,
}

impl ProxyContext {
    /// Check policy for `host:port` and open the upstream connection.
    ///
    /// Returns [`ProxyError::Denied`] without resolving or dialing anything
    /// when the destination is not allowlisted.
    pub async fn connect_upstream(&self, host: &str, port: u16) -> ProxyResult<TcpStream> {
        let host = normalize_host(host);

        if let Some(addr) = self.gateway_route(&host, port) {
            self.audit
                .record(&host, Some(port), Action::Allow, Source::Proxy, Reason::HostGateway);
            return self.dialer.dial_addr(addr).await;
        }

        if !self.allowlist.check_http(&host, port) {
            self.audit
                .record(&host, Some(port), Action::Block, Source::Proxy, Reason::NotAllowlisted);
            return Err(ProxyError::Denied { host, port });
        }

        match self.dialer.dial(&host, port).await {
            Err(e @ ProxyError::BlockedAddress { .. }) => {
                info!("{}", e);
                self.audit
                    .record(&host, Some(port), Action::Block, Source::Proxy, Reason::BlockedAddress);
                Err(e)
            }
            result => {
                self.audit
                    .record(&host, Some(port), Action::Allow, Source::Proxy, Reason::Allowlisted);
                result
            }
        }
    }

    fn gateway_route(&self, host: &str, port: u16) -> Option<SocketAddr> {
        let gateway = self.host_gateway.as_ref()?;
        (host == HOST_GATEWAY_ALIAS && gateway.ports.contains(&port))
            .then(|| SocketAddr::new(gateway.addr, port))
    }
}
