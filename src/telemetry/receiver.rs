//! Plain-HTTP ingest endpoint for agent telemetry.
//!
//! The sandboxed agent posts JSON batches here; the operator reads the
//! accumulated results through the control API.
//!
//! - `POST /v1/metrics`: [`MetricBatch`] body, answers `{"accepted": n}`
//! - `POST /v1/events`: [`EventBatch`] body, answers `{"accepted": n}`
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(TelemetryStore::default());
//! let receiver = TelemetryReceiver::bind("0.0.0.0:4318".parse()?, store, shutdown_rx).await?;
//! receiver.run().await?;
//! ```

use super::TelemetryStore;
use super::error::TelemetryError;
use super::model::{EventBatch, MetricBatch, agent_or_unknown};
use crate::body::{BodyError, ProxyBody, json_error, json_response, read_limited};
use crate::shutdown::{self, DEFAULT_GRACE, ShutdownRx};
use bytes::Bytes;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Largest accepted ingest body.
pub const MAX_INGEST_BODY: usize = 4 * 1024 * 1024;

/// Telemetry ingest listener.
pub struct TelemetryReceiver {
    listener: TcpListener,
    store: Arc<TelemetryStore>,
    shutdown_rx: ShutdownRx,
}

impl TelemetryReceiver {
    /// Bind the ingest port.
    pub async fn bind(
        addr: SocketAddr,
        store: Arc<TelemetryStore>,
        shutdown_rx: ShutdownRx,
    ) -> Result<Self, TelemetryError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TelemetryError::Bind { addr, source })?;
        Ok(Self {
            listener,
            store,
            shutdown_rx,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, TelemetryError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown.
    pub async fn run(self) -> Result<(), TelemetryError> {
        info!("Telemetry receiver listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted telemetry connection from {}", peer);
                            let store = self.store.clone();
                            let shutdown_rx = self.shutdown_rx.clone();
                            tasks.spawn(async move {
                                if let Err(e) = serve_connection(stream, store, shutdown_rx).await {
                                    debug!("Telemetry connection ended: {}", e);
                                }
                            });
                        }
                        Err(e) => warn!("Failed to accept telemetry connection: {}", e),
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown::signalled(&mut shutdown_rx) => {
                    info!("Telemetry receiver shutting down");
                    break;
                }
            }
        }

        shutdown::drain(&mut tasks, DEFAULT_GRACE, "telemetry").await;
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    store: Arc<TelemetryStore>,
    mut shutdown_rx: ShutdownRx,
) -> Result<(), TelemetryError> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let store = store.clone();
        async move { Ok::<_, Infallible>(handle_ingest(req, &store).await) }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
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

/// Route one ingest request.
pub async fn handle_ingest<B>(req: Request<B>, store: &TelemetryStore) -> Response<ProxyBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::POST, "/v1/metrics") => {
            let batch: MetricBatch = match read_json(req.into_body()).await {
                Ok(batch) => batch,
                Err(resp) => return resp,
            };
            let agent = agent_or_unknown(batch.agent.as_deref());
            let accepted = store.metrics.record_all(&agent, batch.samples);
            debug!("Accepted {} metric sample(s) from {}", accepted, agent);
            json_response(StatusCode::OK, &serde_json::json!({ "accepted": accepted }))
        }
        (Method::POST, "/v1/events") => {
            let batch: EventBatch = match read_json(req.into_body()).await {
                Ok(batch) => batch,
                Err(resp) => return resp,
            };
            let agent = agent_or_unknown(batch.agent.as_deref());
            let accepted = batch
                .events
                .into_iter()
                .filter_map(|e| store.events.push(&agent, e))
                .count();
            debug!("Accepted {} event(s) from {}", accepted, agent);
            json_response(StatusCode::OK, &serde_json::json!({ "accepted": accepted }))
        }
        (_, "/v1/metrics" | "/v1/events") => {
            json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn read_json<T, B>(body: B) -> Result<T, Response<ProxyBody>>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = read_limited(body, MAX_INGEST_BODY).await.map_err(|e| match e {
        BodyError::TooLarge { .. } => json_error(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
        BodyError::Read(_) => json_error(StatusCode::BAD_REQUEST, e.to_string()),
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    fn post(path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn json_of(resp: Response<ProxyBody>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_metrics() {
        let store = TelemetryStore::default();
        let body = r#"{"agent":"claude","samples":[
            {"name":"claude_code.token.usage","value":10,"attributes":{"type":"input"}},
            {"name":"claude_code.token.usage","value":5,"attributes":{"type":"input"}},
            {"name":"active","value":2,"kind":"gauge"}
        ]}"#;
        let resp = handle_ingest(post("/v1/metrics", body), &store).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_of(resp).await["accepted"], 3);

        let summaries = store.metrics.summaries();
        assert_eq!(summaries.len(), 2);
        let tokens = summaries.iter().find(|s| s.name.starts_with("claude_code")).unwrap();
        assert_eq!(tokens.value, 15.0);
        assert_eq!(tokens.agent, "claude");
    }

    #[tokio::test]
    async fn test_ingest_events_defaults_agent() {
        let store = TelemetryStore::default();
        let body = r#"{"events":[{"name":"tool_result","attributes":{"tool":"bash"}},{"name":""}]}"#;
        let resp = handle_ingest(post("/v1/events", body), &store).await;
        assert_eq!(json_of(resp).await["accepted"], 1);

        let events = store.events.events_after(0, None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent, "unknown");
        assert_eq!(events[0].attrs["tool"], "bash");
    }

    #[tokio::test]
    async fn test_ingest_rejects_bad_json() {
        let store = TelemetryStore::default();
        let resp = handle_ingest(post("/v1/metrics", "{not json"), &store).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(store.metrics.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_routing() {
        let store = TelemetryStore::default();
        let get = Request::builder()
            .method(Method::GET)
            .uri("/v1/metrics")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(
            handle_ingest(get, &store).await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            handle_ingest(post("/nope", "{}"), &store).await.status(),
            StatusCode::NOT_FOUND
        );
    }
}
