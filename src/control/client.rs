//! mTLS client for the control API.
//!
//! Opens one TLS connection per call, presents the client certificate, and
//! decodes the JSON response. Non-success statuses surface as
//! [`ControlError::Status`] carrying the server's `error` message.
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::control::ControlClient;
//!
//! let client = ControlClient::from_pem(addr, &cert_pem, &key_pem, &ca_pem)?;
//! let added = client.allow_http(&["api.example.com:443".to_string()]).await?;
//! ```

use super::api::{AllowRequest, AllowResponse, ConfigView};
use super::error::{ControlError, ControlResult};
use crate::audit::{DomainStats, LogEntry};
use crate::pki::mtls_client_config;
use crate::pki::tls::{CONTROL_SERVER_NAME, control_server_name};
use crate::telemetry::{MetricSummary, TelemetryEvent};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::form_urlencoded;

/// Client for the control API.
#[derive(Clone)]
pub struct ControlClient {
    addr: SocketAddr,
    connector: TlsConnector,
}

impl ControlClient {
    /// Create a client using an existing TLS configuration.
    pub fn new(addr: SocketAddr, tls: Arc<ClientConfig>) -> Self {
        Self {
            addr,
            connector: TlsConnector::from(tls),
        }
    }

    /// Create a client from PEM-encoded client certificate, key and CA.
    pub fn from_pem(addr: SocketAddr, cert_pem: &str, key_pem: &str, ca_pem: &str) -> ControlResult<Self> {
        Ok(Self::new(addr, mtls_client_config(cert_pem, key_pem, ca_pem)?))
    }

    /// Current allowlists and listener settings.
    pub async fn config(&self) -> ControlResult<ConfigView> {
        self.get("/config").await
    }

    /// Append HTTP entries. Returns the entries that were new.
    pub async fn allow_http(&self, entries: &[String]) -> ControlResult<Vec<String>> {
        self.append("/allow-http", entries).await
    }

    /// Append DNS entries. Returns the entries that were new.
    pub async fn allow_dns(&self, entries: &[String]) -> ControlResult<Vec<String>> {
        self.append("/allow-dns", entries).await
    }

    /// Audit entries newer than `after`.
    pub async fn logs(&self, after: u64) -> ControlResult<Vec<LogEntry>> {
        self.get(&format!("/logs?after={}", after)).await
    }

    /// Per-domain decision counters.
    pub async fn stats(&self) -> ControlResult<BTreeMap<String, DomainStats>> {
        self.get("/stats").await
    }

    /// Aggregated agent metrics.
    pub async fn metrics(&self) -> ControlResult<Vec<MetricSummary>> {
        self.get("/telemetry/metrics").await
    }

    /// Agent events newer than `after`, optionally for one agent.
    pub async fn events(&self, after: u64, agent: Option<&str>) -> ControlResult<Vec<TelemetryEvent>> {
        self.get(&format!("/telemetry/events?{}", events_query(after, agent)))
            .await
    }

    async fn append(&self, path: &str, entries: &[String]) -> ControlResult<Vec<String>> {
        let body = serde_json::to_vec(&AllowRequest {
            entries: entries.to_vec(),
        })?;
        let resp: AllowResponse = self.send(Method::POST, path, Bytes::from(body)).await?;
        Ok(resp.added)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ControlResult<T> {
        self.send(Method::GET, path, Bytes::new()).await
    }

    async fn send<T: DeserializeOwned>(&self, method: Method, path: &str, body: Bytes) -> ControlResult<T> {
        let (status, bytes) = self.request(method, path, body).await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            return Err(ControlError::Status { status, message });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn request(&self, method: Method, path: &str, body: Bytes) -> ControlResult<(StatusCode, Bytes)> {
        let stream = TcpStream::connect(self.addr).await?;
        let tls = self
            .connector
            .connect(control_server_name(), stream)
            .await
            .map_err(|source| ControlError::Handshake {
                peer: self.addr,
                source,
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Control client connection error: {}", e);
            }
        });

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, CONTROL_SERVER_NAME)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|e| ControlError::Request(e.to_string()))?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();
        Ok((status, bytes))
    }
}

/// Query string for `/telemetry/events`, percent-encoded.
fn events_query(after: u64, agent: Option<&str>) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("after", &after.to_string());
    if let Some(agent) = agent {
        query.append_pair("agent", agent);
    }
    query.finish()
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient").field("addr", &self.addr).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::config::ProxyConfig;
    use crate::control::api::{ControlApi, ControlState};
    use crate::pki::CredentialSet;
    use crate::policy::AllowListStore;
    use crate::telemetry::{EventRecord, TelemetryStore};
    use std::time::Duration;
    use tokio::sync::watch;

    struct Running {
        addr: SocketAddr,
        allowlist: Arc<AllowListStore>,
        telemetry: Arc<TelemetryStore>,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn start(creds: &CredentialSet) -> Running {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let allowlist = Arc::new(AllowListStore::new());
        let telemetry = Arc::new(TelemetryStore::default());
        let state = Arc::new(ControlState {
            allowlist: allowlist.clone(),
            audit: Arc::new(AuditLog::new(100)),
            telemetry: telemetry.clone(),
            config: Arc::new(ProxyConfig::default()),
        });
        let api = ControlApi::bind(
            "127.0.0.1:0".parse().unwrap(),
            creds.server_tls_config().unwrap(),
            state,
            shutdown_rx,
        )
        .await
        .unwrap();
        let addr = api.local_addr().unwrap();
        tokio::spawn(api.run());
        Running {
            addr,
            allowlist,
            telemetry,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let creds = CredentialSet::generate(Duration::from_secs(3600)).unwrap();
        let running = start(&creds).await;
        let allowlist = running.allowlist.clone();
        let client = ControlClient::new(running.addr, creds.client_tls_config().unwrap());

        let added = client
            .allow_http(&["api.example.com:443".to_string()])
            .await
            .unwrap();
        assert_eq!(added, vec!["api.example.com:443"]);
        assert!(allowlist.check_http("api.example.com", 443));

        let config = client.config().await.unwrap();
        assert_eq!(config.allowlist.http, vec!["api.example.com:443"]);

        let err = client.allow_dns(&["bad:53".to_string()]).await.unwrap_err();
        assert!(matches!(err, ControlError::Status { status, .. } if status == StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn test_foreign_ca_is_rejected() {
        let creds = CredentialSet::generate(Duration::from_secs(3600)).unwrap();
        let other = CredentialSet::generate(Duration::from_secs(3600)).unwrap();
        let running = start(&creds).await;
        let (addr, allowlist) = (running.addr, running.allowlist.clone());

        // Client certificate from a different CA, but trusting the real server
        let client = ControlClient::from_pem(
            addr,
            other.client_cert_pem(),
            other.client_key_pem(),
            creds.ca_cert_pem(),
        )
        .unwrap();
        assert!(
            client
                .allow_http(&["evil.example:443".to_string()])
                .await
                .is_err()
        );
        assert!(!allowlist.check_http("evil.example", 443));
    }

    #[test]
    fn test_events_query_encoding() {
        assert_eq!(events_query(5, None), "after=5");
        assert_eq!(
            events_query(0, Some("claude code&x=1")),
            "after=0&agent=claude+code%26x%3D1"
        );
    }

    #[tokio::test]
    async fn test_events_agent_filter_round_trip() {
        let creds = CredentialSet::generate(Duration::from_secs(3600)).unwrap();
        let running = start(&creds).await;
        let record = |name: &str| EventRecord {
            name: name.to_string(),
            attributes: Default::default(),
        };
        running.telemetry.events.push("claude code&co", record("tool_result"));
        running.telemetry.events.push("codex", record("turn"));

        let client = ControlClient::new(running.addr, creds.client_tls_config().unwrap());
        let events = client.events(0, Some("claude code&co")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent, "claude code&co");
        assert_eq!(events[0].event_name, "tool_result");

        assert_eq!(client.events(0, None).await.unwrap().len(), 2);
    }
}
