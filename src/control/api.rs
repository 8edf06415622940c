//! HTTPS control API with mutual TLS.
//!
//! The host operator uses this to inspect and widen the allowlist while the
//! agent runs. Every connection must complete a TLS 1.3 handshake with a
//! client certificate signed by the configured CA; peers that cannot are
//! dropped before any HTTP request is read.
//!
//! # Endpoints
//!
//! | Method | Path                  | Response                                  |
//! |--------|-----------------------|-------------------------------------------|
//! | GET    | `/config`             | live allowlists and listener settings     |
//! | POST   | `/allow-http`         | `{"added": [...]}` or 400                 |
//! | POST   | `/allow-dns`          | `{"added": [...]}` or 400                 |
//! | GET    | `/logs?after=<id>`    | audit entries newer than `id`             |
//! | GET    | `/stats`              | per-domain allow/block counters           |
//! | GET    | `/telemetry/metrics`  | aggregated metric summaries               |
//! | GET    | `/telemetry/events`   | events, filtered by `after` and `agent`   |
//!
//! POST bodies are `{"entries": ["..."]}`. A batch is applied only if every
//! entry is valid.

use super::error::{ControlError, ControlResult};
use crate::audit::AuditLog;
use crate::body::{BodyError, ProxyBody, json_error, json_response, read_limited};
use crate::config::ProxyConfig;
use crate::policy::{AllowListSnapshot, AllowListStore, PolicyResult};
use crate::shutdown::{self, DEFAULT_GRACE, ShutdownRx};
use crate::telemetry::TelemetryStore;
use bytes::Bytes;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use url::form_urlencoded;

/// Largest accepted request body.
pub const MAX_CONTROL_BODY: usize = 1024 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of `POST /allow-http` and `POST /allow-dns`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowRequest {
    /// Entries to append.
    #[serde(default)]
    pub entries: Vec<String>,
}

/// Successful append response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowResponse {
    /// Entries that were not already present.
    pub added: Vec<String>,
}

/// Body of `GET /config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigView {
    /// Current allowlists.
    #[serde(flatten)]
    pub allowlist: AllowListSnapshot,
    /// Upstream DNS resolver.
    pub upstream: String,
    /// HTTP proxy port.
    pub proxy_port: u16,
    /// Control API port.
    pub control_api_port: u16,
    /// DNS port.
    pub dns_port: u16,
    /// Telemetry ingest port, if enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_port: Option<u16>,
}

/// State the control API reads and mutates.
pub struct ControlState {
    /// Shared allowlist.
    pub allowlist: Arc<AllowListStore>,
    /// Decision log.
    pub audit: Arc<AuditLog>,
    /// Agent telemetry.
    pub telemetry: Arc<TelemetryStore>,
    /// Startup configuration, for listener settings.
    pub config: Arc<ProxyConfig>,
}

impl ControlState {
    fn config_view(&self) -> ConfigView {
        ConfigView {
            allowlist: self.allowlist.snapshot(),
            upstream: self.config.upstream.clone(),
            proxy_port: self.config.proxy_port,
            control_api_port: self.config.control_api_port,
            dns_port: self.config.dns_port,
            telemetry_port: self.config.telemetry_port,
        }
    }
}

/// The control API listener.
pub struct ControlApi {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ControlState>,
    shutdown_rx: ShutdownRx,
}

impl ControlApi {
    /// Bind the control port.
    pub async fn bind(
        addr: SocketAddr,
        tls: Arc<ServerConfig>,
        state: Arc<ControlState>,
        shutdown_rx: ShutdownRx,
    ) -> ControlResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ControlError::Bind { addr, source })?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            state,
            shutdown_rx,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> ControlResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown.
    pub async fn run(self) -> ControlResult<()> {
        info!("Control API listening on {} (mTLS)", self.local_addr()?);

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let acceptor = self.acceptor.clone();
                            let state = self.state.clone();
                            let shutdown_rx = self.shutdown_rx.clone();
                            tasks.spawn(async move {
                                match serve_connection(stream, peer, acceptor, state, shutdown_rx).await {
                                    Err(e @ (ControlError::Handshake { .. } | ControlError::HandshakeTimeout { .. })) => {
                                        info!("Rejected control connection: {}", e);
                                    }
                                    Err(e) => debug!("Control connection from {} ended: {}", peer, e),
                                    Ok(()) => {}
                                }
                            });
                        }
                        Err(e) => warn!("Failed to accept control connection: {}", e),
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown::signalled(&mut shutdown_rx) => {
                    info!("Control API shutting down");
                    break;
                }
            }
        }

        shutdown::drain(&mut tasks, DEFAULT_GRACE, "control").await;
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ControlState>,
    mut shutdown_rx: ShutdownRx,
) -> ControlResult<()> {
    // Client certificate verification happens inside the handshake
    let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .map_err(|_| ControlError::HandshakeTimeout { peer })?
        .map_err(|source| ControlError::Handshake { peer, source })?;
    debug!("Control client {} authenticated", peer);

    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle_control(req, &state).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls), service);
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => result?,
        _ = shutdown::signalled(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
            conn.await?;
        }
    }
    Ok(())
}

/// Route one authenticated control request.
pub async fn handle_control<B>(req: Request<B>, state: &ControlState) -> Response<ProxyBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();

    match (method, path.as_str()) {
        (Method::GET, "/config") => json_response(StatusCode::OK, &state.config_view()),
        (Method::POST, "/allow-http") => {
            append(req.into_body(), |entries| state.allowlist.append_http(entries)).await
        }
        (Method::POST, "/allow-dns") => {
            append(req.into_body(), |entries| state.allowlist.append_dns(entries)).await
        }
        (Method::GET, "/logs") => {
            let after = query_u64(&query, "after");
            json_response(StatusCode::OK, &state.audit.entries_after(after))
        }
        (Method::GET, "/stats") => json_response(StatusCode::OK, &state.audit.stats()),
        (Method::GET, "/telemetry/metrics") => {
            json_response(StatusCode::OK, &state.telemetry.metrics.summaries())
        }
        (Method::GET, "/telemetry/events") => {
            let after = query_u64(&query, "after");
            let agent = query_param(&query, "agent").filter(|a| !a.is_empty());
            let events = state.telemetry.events.events_after(after, agent.as_deref());
            json_response(StatusCode::OK, &events)
        }
        (
            _,
            "/config" | "/allow-http" | "/allow-dns" | "/logs" | "/stats" | "/telemetry/metrics"
            | "/telemetry/events",
        ) => json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn append<B, F>(body: B, apply: F) -> Response<ProxyBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    F: FnOnce(&[String]) -> PolicyResult<Vec<String>>,
{
    let bytes = match read_limited(body, MAX_CONTROL_BODY).await {
        Ok(bytes) => bytes,
        Err(e @ BodyError::TooLarge { .. }) => {
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, e.to_string());
        }
        Err(e) => return json_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let request: AllowRequest = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "invalid JSON"),
    };
    if request.entries.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "entries required");
    }

    match apply(&request.entries) {
        Ok(added) => {
            info!("Allowlist extended with {:?}", added);
            json_response(StatusCode::OK, &AllowResponse { added })
        }
        Err(e) => {
            debug!("Rejected allowlist append: {}", e);
            json_error(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

/// First value of `name` in a query string, percent-decoded.
fn query_param(query: &str, name: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Unparsable or missing values read as 0.
fn query_u64(query: &str, name: &str) -> u64 {
    query_param(query, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
