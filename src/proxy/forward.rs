//! Plain (non-CONNECT) HTTP forward proxying.
//!
//! Requests arrive in absolute form (`GET http://host/path HTTP/1.1`). The
//! target comes from the URI, falling back to the `Host` header, with port
//! 80 by default. Allowed requests are rewritten to origin form, stripped
//! of hop-by-hop and proxy headers, and replayed on a fresh upstream
//! HTTP/1.1 connection; the upstream response is streamed back.

use super::connect::{error_response, parse_host_port};
use super::error::ProxyError;
use super::upstream::ProxyContext;
use crate::body::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, info};

/// Default port for plain HTTP targets without one.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Headers that apply to a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Handle a plain HTTP proxy request.
pub async fn handle_http(req: Request<Incoming>, ctx: Arc<ProxyContext>) -> Response<ProxyBody> {
    let (host, port) = match target_of(&req) {
        Ok(target) => target,
        Err(e) => return error_response(&e),
    };

    debug!("HTTP {} {}:{}", req.method(), host, port);

    let upstream = match ctx.connect_upstream(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            info!("HTTP {}:{} refused: {}", host, port, e);
            return error_response(&e);
        }
    };

    match forward(req, upstream, &host, port).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!("Forwarding to {}:{} failed: {}", host, port, e);
            error_response(&e)
        }
    }
}

/// Extract the destination of a plain proxy request.
pub fn target_of<B>(req: &Request<B>) -> Result<(String, u16), ProxyError> {
    if let Some(authority) = req.uri().authority() {
        return parse_host_port(authority.as_str(), DEFAULT_HTTP_PORT);
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ProxyError::BadRequest("request has no absolute URI or Host header".into()))?;
    parse_host_port(host, DEFAULT_HTTP_PORT)
}

async fn forward(
    req: Request<Incoming>,
    upstream: tokio::net::TcpStream,
    host: &str,
    port: u16,
) -> Result<Response<ProxyBody>, ProxyError> {
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(upstream))
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: format!("{}:{}", host, port),
            message: e.to_string(),
        })?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection error: {}", e);
        }
    });

    let req = to_origin_form(req, host, port)?;
    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: format!("{}:{}", host, port),
            message: e.to_string(),
        })?;

    let (mut parts, body) = resp.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Rewrite an absolute-form request for the origin server.
fn to_origin_form<B>(req: Request<B>, host: &str, port: u16) -> Result<Request<B>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    parts.uri = path
        .parse::<Uri>()
        .map_err(|e| ProxyError::BadRequest(format!("invalid path: {}", e)))?;

    strip_hop_by_hop(&mut parts.headers);

    let host_value = if port == DEFAULT_HTTP_PORT {
        host.to_string()
    } else if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let host_value = HeaderValue::from_str(&host_value)
        .map_err(|_| ProxyError::BadRequest(format!("invalid host '{}'", host)))?;
    parts.headers.insert(header::HOST, host_value);

    Ok(Request::from_parts(parts, body))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
