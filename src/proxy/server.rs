//! HTTP forward proxy listener.
//!
//! This module provides the proxy server that:
//! - Listens for TCP connections from the sandbox network
//! - Handles HTTP CONNECT for HTTPS tunneling
//! - Handles plain HTTP requests
//! - Checks every destination against the shared allowlist
//!
//! # Architecture
//!
//! The proxy uses hyper's HTTP/1.1 server with upgrade support for CONNECT.
//! Each connection is handled in a separate Tokio task tracked in a
//! `JoinSet`; on shutdown the listener stops accepting, asks open
//! connections to finish, and aborts whatever remains after the grace period.
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::proxy::{HttpProxyListener, ProxyContext};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let listener = HttpProxyListener::bind("0.0.0.0:3128".parse()?, ctx).await?;
//! tokio::spawn(listener.run());
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use super::connect::{PendingTunnel, handle_connect};
use super::error::{ProxyError, ProxyResult};
use super::forward::handle_http;
use super::upstream::ProxyContext;
use crate::body::ProxyBody;
use crate::shutdown::{self, DEFAULT_GRACE};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// The HTTP proxy listener.
pub struct HttpProxyListener {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
}

impl HttpProxyListener {
    /// Bind the proxy port.
    pub async fn bind(addr: SocketAddr, ctx: Arc<ProxyContext>) -> ProxyResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        Ok(Self { listener, ctx })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until shutdown is signalled.
    pub async fn run(self) -> ProxyResult<()> {
        info!("HTTP proxy listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.ctx.shutdown_rx.clone();
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted proxy connection from {}", peer);
                            let ctx = self.ctx.clone();
                            tasks.spawn(async move {
                                if let Err(e) = handle_connection(stream, ctx).await {
                                    log_connection_error(&e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown::signalled(&mut shutdown_rx) => {
                    info!("HTTP proxy shutting down");
                    break;
                }
            }
        }

        shutdown::drain(&mut tasks, DEFAULT_GRACE, "proxy").await;
        Ok(())
    }
}

/// Handle a single client connection.
///
/// A CONNECT tunnel runs here after hyper hands over the upgraded stream,
/// so it stays inside the listener's `JoinSet` and is covered by the drain.
async fn handle_connection(stream: TcpStream, ctx: Arc<ProxyContext>) -> ProxyResult<()> {
    let io = TokioIo::new(stream);
    let mut shutdown_rx = ctx.shutdown_rx.clone();
    let (tunnel_tx, mut tunnel_rx) = mpsc::unbounded_channel::<PendingTunnel>();

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let tunnel_tx = tunnel_tx.clone();
        async move { Ok::<_, Infallible>(proxy_request(req, ctx, &tunnel_tx).await) }
    });

    // Serve HTTP/1.1 with support for upgrades (needed for CONNECT)
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result?,
        _ = shutdown::signalled(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
            conn.await?;
        }
    }

    while let Ok(tunnel) = tunnel_rx.try_recv() {
        tunnel.await;
    }
    Ok(())
}

/// Process a single proxy request.
async fn proxy_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    tunnels: &mpsc::UnboundedSender<PendingTunnel>,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        // HTTPS tunneling via CONNECT
        let (response, tunnel) = handle_connect(req, ctx).await;
        if let Some(tunnel) = tunnel {
            let _ = tunnels.send(tunnel);
        }
        response
    } else {
        // Plain HTTP proxying
        handle_http(req, ctx).await
    }
}

fn log_connection_error(e: &ProxyError) {
    // Clients hanging up are routine
    if e.is_disconnect() {
        debug!("Connection ended: {}", e);
    } else {
        warn!("Connection error: {}", e);
    }
}
