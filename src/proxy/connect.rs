//! HTTP CONNECT method handling for HTTPS tunneling.
//!
//! The flow is:
//!
//! 1. Client sends: `CONNECT api.example.com:443 HTTP/1.1`
//! 2. Proxy checks `api.example.com:443` against the HTTP allowlist
//! 3. If blocked: Return `403 Forbidden`, nothing is dialed
//! 4. If allowed: Dial upstream; on failure return `502`/`504`
//! 5. On success: Return `200 Connection Established` and splice bytes
//!
//! The tunnel is opaque: TLS runs end to end between the client and the
//! upstream server.
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::proxy::connect::handle_connect;
//!
//! // Called from the proxy server when a CONNECT request is received.
//! // The tunnel runs after the 200 has been written, in the connection task.
//! let (response, tunnel) = handle_connect(request, ctx).await;
//! ```

use super::error::ProxyError;
use super::upstream::ProxyContext;
use crate::body::{ProxyBody, status_response, text_response};
use crate::shutdown::{self, ShutdownRx};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default port for CONNECT targets without one.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// An accepted tunnel, to be driven once the `200` has been sent.
pub type PendingTunnel = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handle an HTTP CONNECT request.
///
/// The upstream connection is established before the `200` is sent, so a
/// client never sees a successful CONNECT for an unreachable destination.
/// On success the returned [`PendingTunnel`] must be awaited by the task
/// that owns the client connection.
pub async fn handle_connect(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> (Response<ProxyBody>, Option<PendingTunnel>) {
    let Some(authority) = req.uri().authority() else {
        let err = ProxyError::BadRequest("missing authority in CONNECT request".into());
        return (error_response(&err), None);
    };

    let (host, port) = match parse_host_port(authority.as_str(), DEFAULT_CONNECT_PORT) {
        Ok(target) => target,
        Err(e) => return (error_response(&e), None),
    };

    debug!("CONNECT request to {}:{}", host, port);

    let upstream = match ctx.connect_upstream(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            info!("CONNECT {}:{} refused: {}", host, port, e);
            return (error_response(&e), None);
        }
    };

    let shutdown_rx = ctx.shutdown_rx.clone();
    let pending: PendingTunnel = Box::pin(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let (sent, received) = tunnel(upgraded, upstream, shutdown_rx).await;
                debug!(
                    "Tunnel to {}:{} closed ({} bytes up, {} bytes down)",
                    host, port, sent, received
                );
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}:{}: {}", host, port, e);
            }
        }
    });

    (status_response(StatusCode::OK), Some(pending))
}

/// Splice bytes between the upgraded client connection and upstream.
///
/// Each direction runs in its own task. The tunnel ends when either task
/// finishes or shutdown is signalled; the other task is aborted and both
/// are joined before returning. Dropping the returned future aborts both
/// copies. Returns bytes copied in each direction.
pub async fn tunnel(upgraded: Upgraded, upstream: TcpStream, mut shutdown_rx: ShutdownRx) -> (u64, u64) {
    let (mut client_read, mut client_write) = tokio::io::split(TokioIo::new(upgraded));
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let mut copies = JoinSet::new();
    copies.spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        (Direction::ClientToUpstream, copied)
    });
    copies.spawn(async move {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        (Direction::UpstreamToClient, copied)
    });

    let first = tokio::select! {
        joined = copies.join_next() => joined,
        _ = shutdown::signalled(&mut shutdown_rx) => {
            debug!("Closing tunnel on shutdown");
            None
        }
    };
    copies.abort_all();

    let mut totals = (0, 0);
    let mut tally = |joined: Result<(Direction, std::io::Result<u64>), tokio::task::JoinError>| {
        match joined {
            Ok((Direction::ClientToUpstream, Ok(n))) => totals.0 = n,
            Ok((Direction::UpstreamToClient, Ok(n))) => totals.1 = n,
            Ok((direction, Err(e))) => debug!("{:?} copy ended: {}", direction, e),
            Err(_) => {}
        }
    };
    if let Some(joined) = first {
        tally(joined);
    }
    while let Some(joined) = copies.join_next().await {
        tally(joined);
    }
    totals
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Parse `host:port` from a request authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", default_port)
/// - `[::1]:8443` -> ("::1", 8443)
pub fn parse_host_port(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let invalid_port =
        |port: &str| ProxyError::BadRequest(format!("invalid port '{}' in '{}'", port, authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::BadRequest(format!("unterminated IPv6 host '{}'", authority)))?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse::<u16>().map_err(|_| invalid_port(p))?,
            None if after.is_empty() => default_port,
            None => return Err(ProxyError::BadRequest(format!("invalid authority '{}'", authority))),
        };
        (host, port)
    } else if let Some((host, port)) = authority.rsplit_once(':') {
        (host, port.parse::<u16>().map_err(|_| invalid_port(port))?)
    } else {
        (authority, default_port)
    };

    if host.is_empty() {
        return Err(ProxyError::BadRequest(format!("missing host in '{}'", authority)));
    }
    if port == 0 {
        return Err(invalid_port("0"));
    }
    Ok((host.to_string(), port))
}

/// Map a proxy error to the response sent to the client.
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let message = match err {
        ProxyError::Denied { host, .. } => format!("domain {:?} is not in the allowlist", host),
        other => other.to_string(),
    };
    text_response(err.status(), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("api.example.com:443", 443).unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_host_port_custom_port() {
        let (host, port) = parse_host_port("api.example.com:8443", 443).unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("api.example.com", 80).unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 80);
    }

    #[test]
    fn test_parse_host_port_invalid_port() {
        assert!(parse_host_port("api.example.com:invalid", 443).is_err());
        assert!(parse_host_port("api.example.com:0", 443).is_err());
        assert!(parse_host_port(":443", 443).is_err());
    }

    #[test]
    fn test_parse_host_port_ipv6() {
        let (host, port) = parse_host_port("[::1]:443", 80).unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
        assert_eq!(parse_host_port("[::1]", 80).unwrap().1, 80);
        assert!(parse_host_port("[::1", 80).is_err());
    }

    #[test]
    fn test_error_response_status() {
        let denied = ProxyError::Denied {
            host: "evil.example".to_string(),
            port: 443,
        };
        assert_eq!(error_response(&denied).status(), StatusCode::FORBIDDEN);

        let bad = ProxyError::BadRequest("nope".into());
        assert_eq!(error_response(&bad).status(), StatusCode::BAD_REQUEST);
    }
}
