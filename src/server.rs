//! Proxy server composition and lifecycle.
//!
//! [`ProxyServer`] owns the shared state (allowlist, audit log, telemetry)
//! and hands it to each listener at construction:
//!
//! ```text
//!                 ┌──────────────────┐
//!   sandbox ────► │ HTTP proxy :3128 │──┐
//!   sandbox ────► │ DNS        :53   │──┼──► AllowListStore ◄── Control API :3129 (mTLS) ◄── host
//!   sandbox ────► │ Telemetry  :opt  │  │          │
//!                 └──────────────────┘  └──► AuditLog / TelemetryStore
//! ```
//!
//! Startup is two-phase: [`ProxyServer::bind`] binds every port (failures
//! are fatal), then [`BoundServer::run`] serves until the shutdown signal.
//!
//! # Example
//!
//! ```ignore
//! let config = ConfigLoader::new().load(Some(path))?;
//! let server = ProxyServer::new(config, TlsMaterial::from_env()?)?;
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let bound = server.bind(shutdown_rx).await?;
//! tokio::spawn(async move {
//!     wait_for_signal().await;
//!     let _ = shutdown_tx.send(true);
//! });
//! bound.run().await?;
//! ```

use crate::audit::AuditLog;
use crate::config::{ConfigError, ConfigResult, ProxyConfig, TlsMaterial};
use crate::control::{ControlApi, ControlState};
use crate::dns::{DnsContext, DnsProxyListener};
use crate::policy::AllowListStore;
use crate::proxy::{Dialer, HostGateway, HttpProxyListener, ProxyContext};
use crate::shutdown::{DEFAULT_GRACE, ShutdownRx};
use crate::telemetry::{TelemetryReceiver, TelemetryStore};
use anyhow::{Context, Result};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Shared state and configuration, ready to bind.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    tls: Option<Arc<ServerConfig>>,
    allowlist: Arc<AllowListStore>,
    audit: Arc<AuditLog>,
    telemetry: Arc<TelemetryStore>,
}

impl ProxyServer {
    /// Validate `config`, seed the allowlist and prepare the control API TLS
    /// config. `tls == None` disables the control API.
    pub fn new(config: ProxyConfig, tls: Option<TlsMaterial>) -> ConfigResult<Self> {
        config.validate()?;
        let allowlist = AllowListStore::with_entries(&config.allow_http, &config.allow_dns)
            .map_err(|e| ConfigError::InvalidValue {
                field: "allowlist".to_string(),
                message: e.to_string(),
            })?;
        let tls = tls.map(|material| material.server_config()).transpose()?;

        Ok(Self {
            config: Arc::new(config),
            tls,
            allowlist: Arc::new(allowlist),
            audit: Arc::new(AuditLog::default()),
            telemetry: Arc::new(TelemetryStore::default()),
        })
    }

    /// The shared allowlist.
    pub fn allowlist(&self) -> Arc<AllowListStore> {
        self.allowlist.clone()
    }

    /// The shared decision log.
    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    /// The shared telemetry store.
    pub fn telemetry(&self) -> Arc<TelemetryStore> {
        self.telemetry.clone()
    }

    /// Bind every listener. Any failure here is fatal.
    pub async fn bind(self, shutdown_rx: ShutdownRx) -> Result<BoundServer> {
        let config = &self.config;
        let blocker = config.blocker()?;

        let host_gateway = config.host_gateway.map(|addr| HostGateway {
            addr,
            ports: config.allow_host_ports.clone(),
        });
        let proxy_ctx = Arc::new(ProxyContext {
            allowlist: self.allowlist.clone(),
            audit: self.audit.clone(),
            dialer: Dialer::new(blocker.clone(), config.dial_timeout()),
            host_gateway,
            shutdown_rx: shutdown_rx.clone(),
        });
        let http = HttpProxyListener::bind(config.listen_addr(config.proxy_port), proxy_ctx)
            .await
            .context("Failed to start HTTP proxy")?;

        let upstream = config.resolve_upstream().await?;
        let dns_ctx = Arc::new(DnsContext {
            allowlist: self.allowlist.clone(),
            audit: self.audit.clone(),
            blocker,
            upstream,
            timeout: config.dns_timeout(),
            alias_ip: config.host_gateway.and(config.proxy_ip),
            shutdown_rx: shutdown_rx.clone(),
        });
        let dns = DnsProxyListener::bind(config.listen_addr(config.dns_port), dns_ctx)
            .await
            .context("Failed to start DNS proxy")?;

        let control = match &self.tls {
            Some(tls) => {
                let state = Arc::new(ControlState {
                    allowlist: self.allowlist.clone(),
                    audit: self.audit.clone(),
                    telemetry: self.telemetry.clone(),
                    config: self.config.clone(),
                });
                let api = ControlApi::bind(
                    config.listen_addr(config.control_api_port),
                    tls.clone(),
                    state,
                    shutdown_rx.clone(),
                )
                .await
                .context("Failed to start control API")?;
                Some(api)
            }
            None => None,
        };

        let telemetry = match config.telemetry_port {
            Some(port) => Some(
                TelemetryReceiver::bind(config.listen_addr(port), self.telemetry.clone(), shutdown_rx)
                    .await
                    .context("Failed to start telemetry receiver")?,
            ),
            None => None,
        };

        let addrs = BoundAddrs {
            proxy: http.local_addr()?,
            dns: dns.local_addr()?,
            control: control.as_ref().map(ControlApi::local_addr).transpose()?,
            telemetry: telemetry.as_ref().map(TelemetryReceiver::local_addr).transpose()?,
        };

        Ok(BoundServer {
            addrs,
            http,
            dns,
            control,
            telemetry,
        })
    }
}

/// Addresses the listeners actually bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    /// HTTP proxy.
    pub proxy: SocketAddr,
    /// DNS (UDP and TCP).
    pub dns: SocketAddr,
    /// Control API, if enabled.
    pub control: Option<SocketAddr>,
    /// Telemetry ingest, if enabled.
    pub telemetry: Option<SocketAddr>,
}

/// Listeners bound and waiting to serve.
pub struct BoundServer {
    addrs: BoundAddrs,
    http: HttpProxyListener,
    dns: DnsProxyListener,
    control: Option<ControlApi>,
    telemetry: Option<TelemetryReceiver>,
}

impl BoundServer {
    /// Where each listener is bound.
    pub fn addrs(&self) -> BoundAddrs {
        self.addrs
    }

    /// Serve until the shutdown signal, then wait for every listener to stop.
    ///
    /// Each listener drains its own connections within [`DEFAULT_GRACE`].
    pub async fn run(self) -> Result<()> {
        info!(
            "Egress proxy up: http={} dns={} control={}",
            self.addrs.proxy,
            self.addrs.dns,
            self.addrs
                .control
                .map(|a| a.to_string())
                .unwrap_or_else(|| "disabled".to_string())
        );

        let mut listeners: JoinSet<Result<()>> = JoinSet::new();
        let http = self.http;
        listeners.spawn(async move { http.run().await.context("HTTP proxy failed") });
        let dns = self.dns;
        listeners.spawn(async move { dns.run().await.context("DNS proxy failed") });
        if let Some(control) = self.control {
            listeners.spawn(async move { control.run().await.context("Control API failed") });
        } else {
            warn!("Control API disabled: no TLS material");
        }
        if let Some(telemetry) = self.telemetry {
            listeners.spawn(async move { telemetry.run().await.context("Telemetry receiver failed") });
        }

        let mut first_error = None;
        while let Some(joined) = listeners.join_next().await {
            let result = joined.context("Listener task panicked").and_then(|r| r);
            if let Err(e) = result {
                error!("{:#}", e);
                first_error.get_or_insert(e);
            }
        }

        info!("Egress proxy stopped (grace {:?})", DEFAULT_GRACE);
        first_error.map_or(Ok(()), Err)
    }
}

/// Resolve on Ctrl-C or SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }
}
