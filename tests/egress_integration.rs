//! End-to-end tests driving real listeners on loopback.
//!
//! Listeners are composed by hand with loopback allowed in the blocked
//! ranges, so local fake upstreams stand in for the internet.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use egress_warden::audit::AuditLog;
use egress_warden::config::ProxyConfig;
use egress_warden::control::{ControlApi, ControlClient, ControlError, ControlState};
use egress_warden::dns::wire::{Query, Rcode, TYPE_A, encode_query, rcode_of};
use egress_warden::dns::{DnsContext, DnsProxyListener};
use egress_warden::pki::CredentialSet;
use egress_warden::pki::tls::{control_server_name, parse_certificates};
use egress_warden::policy::{AllowListStore, CidrBlocker};
use egress_warden::proxy::{Dialer, HttpProxyListener, ProxyContext};
use egress_warden::telemetry::{TelemetryReceiver, TelemetryStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;

const STEP: Duration = Duration::from_secs(5);

struct Harness {
    allowlist: Arc<AllowListStore>,
    telemetry: Arc<TelemetryStore>,
    proxy: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

async fn harness(http: &[&str], dns: &[&str]) -> Harness {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let http: Vec<String> = http.iter().map(|s| s.to_string()).collect();
    let dns: Vec<String> = dns.iter().map(|s| s.to_string()).collect();
    let allowlist = Arc::new(AllowListStore::with_entries(&http, &dns).unwrap());

    let ctx = Arc::new(ProxyContext {
        allowlist: allowlist.clone(),
        audit: Arc::new(AuditLog::new(100)),
        dialer: Dialer::new(CidrBlocker::none(), Duration::from_secs(2)),
        host_gateway: None,
        shutdown_rx: shutdown_rx.clone(),
    });
    let listener = HttpProxyListener::bind("127.0.0.1:0".parse().unwrap(), ctx)
        .await
        .unwrap();
    let proxy = listener.local_addr().unwrap();
    tokio::spawn(listener.run());

    Harness {
        allowlist,
        telemetry: Arc::new(TelemetryStore::default()),
        proxy,
        shutdown_tx,
        shutdown_rx,
    }
}

impl Harness {
    async fn control(&self, creds: &CredentialSet) -> SocketAddr {
        let state = Arc::new(ControlState {
            allowlist: self.allowlist.clone(),
            audit: Arc::new(AuditLog::new(100)),
            telemetry: self.telemetry.clone(),
            config: Arc::new(ProxyConfig::default()),
        });
        let api = ControlApi::bind(
            "127.0.0.1:0".parse().unwrap(),
            creds.server_tls_config().unwrap(),
            state,
            self.shutdown_rx.clone(),
        )
        .await
        .unwrap();
        let addr = api.local_addr().unwrap();
        tokio::spawn(api.run());
        addr
    }
}

/// Echo server counting accepted connections.
async fn echo_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    (addr, accepted)
}

/// Send CONNECT and return the proxy's status line plus the open stream.
async fn connect_via(proxy: SocketAddr, target: SocketAddr) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(STEP, stream.read(&mut byte)).await.unwrap().unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).to_string();
    let status = head.lines().next().unwrap_or_default().to_string();
    (status, stream)
}

#[tokio::test]
async fn test_connect_allowed_tunnels_bytes_both_ways() {
    let (echo, _) = echo_server().await;
    let entry = echo.to_string();
    let h = harness(&[entry.as_str()], &[]).await;

    let (status, mut stream) = connect_via(h.proxy, echo).await;
    assert!(status.starts_with("HTTP/1.1 200"), "got {:?}", status);

    for message in [&b"first"[..], b"second message", &[0u8, 255, 1, 254]] {
        stream.write_all(message).await.unwrap();
        let mut buf = vec![0u8; message.len()];
        tokio::time::timeout(STEP, stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, message);
    }
}

#[tokio::test]
async fn test_connect_denied_never_reaches_upstream() {
    let (echo, accepted) = echo_server().await;
    let h = harness(&["other.example:443"], &[]).await;

    let (status, _stream) = connect_via(h.proxy, echo).await;
    assert!(status.starts_with("HTTP/1.1 403"), "got {:?}", status);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connect_to_closed_port_is_bad_gateway() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let entry = closed.to_string();
    let h = harness(&[entry.as_str()], &[]).await;

    let (status, _stream) = connect_via(h.proxy, closed).await;
    assert!(status.starts_with("HTTP/1.1 502"), "got {:?}", status);
}

#[tokio::test]
async fn test_plain_http_forwarded_in_origin_form() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<String>();
    tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        let _ = seen_tx.send(String::from_utf8_lossy(&head).to_string());
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();
    });

    let entry = origin_addr.to_string();
    let h = harness(&[entry.as_str()], &[]).await;

    let mut client = TcpStream::connect(h.proxy).await.unwrap();
    let request = format!(
        "GET http://{origin_addr}/path?q=1 HTTP/1.1\r\nHost: {origin_addr}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(STEP, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "got {:?}", response);
    assert!(response.ends_with("hello"));

    let seen = seen_rx.await.unwrap().to_ascii_lowercase();
    assert!(seen.starts_with("get /path?q=1 http/1.1"), "origin saw {:?}", seen);
    assert!(!seen.contains("proxy-connection"));
}

#[tokio::test]
async fn test_control_append_then_connect_allowed() {
    let (echo, _) = echo_server().await;
    let h = harness(&[], &[]).await;
    let creds = CredentialSet::generate(Duration::from_secs(3600)).unwrap();
    let control = h.control(&creds).await;
    let client = ControlClient::new(control, creds.client_tls_config().unwrap());

    let (status, _) = connect_via(h.proxy, echo).await;
    assert!(status.starts_with("HTTP/1.1 403"), "got {:?}", status);

    let added = client.allow_http(&[echo.to_string()]).await.unwrap();
    assert_eq!(added, vec![echo.to_string()]);

    let (status, _) = connect_via(h.proxy, echo).await;
    assert!(status.starts_with("HTTP/1.1 200"), "got {:?}", status);

    // Appending again leaves the set unchanged
    let added = client.allow_http(&[echo.to_string()]).await.unwrap();
    assert!(added.is_empty());
    assert_eq!(client.config().await.unwrap().allowlist.http.len(), 1);
}

#[tokio::test]
async fn test_control_validation_leaves_store_unchanged() {
    let h = harness(&["keep.example:443"], &[]).await;
    let creds = CredentialSet::generate(Duration::from_secs(3600)).unwrap();
    let control = h.control(&creds).await;
    let client = ControlClient::new(control, creds.client_tls_config().unwrap());
    let before = h.allowlist.snapshot();

    let err = client
        .allow_http(&["added-http.example".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Status { .. }));
    assert_eq!(h.allowlist.snapshot(), before);

    let err = client
        .allow_dns(&["internal.example.com:443".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Status { .. }));
    assert_eq!(h.allowlist.snapshot(), before);

    client
        .allow_dns(&["internal.example.com".to_string()])
        .await
        .unwrap();
    assert!(h.allowlist.check_dns("internal.example.com"));
}

#[tokio::test]
async fn test_control_without_client_certificate_is_rejected() {
    let h = harness(&[], &[]).await;
    let creds = CredentialSet::generate(Duration::from_secs(3600)).unwrap();
    let control = h.control(&creds).await;
    let before = h.allowlist.snapshot();

    let mut roots = rustls::RootCertStore::empty();
    for cert in parse_certificates(creds.ca_cert_pem(), "CA").unwrap() {
        roots.add(cert).unwrap();
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let body = r#"{"entries":["evil.example:443"]}"#;
    let request = format!(
        "POST /allow-http HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    let stream = TcpStream::connect(control).await.unwrap();
    if let Ok(mut tls) = connector.connect(control_server_name(), stream).await {
        // TLS 1.3 clients may finish before the server rejects the certificate
        let _ = tls.write_all(request.as_bytes()).await;
        let mut response = Vec::new();
        let read = tokio::time::timeout(STEP, tls.read_to_end(&mut response)).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(read.is_err() || !text.starts_with("HTTP/1.1 200"), "got {:?}", text);
    }

    assert_eq!(h.allowlist.snapshot(), before);
    assert!(!h.allowlist.check_http("evil.example", 443));
}

/// UDP resolver answering every query with one A record.
async fn fake_resolver(answer: Ipv4Addr) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = queries.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            counter.fetch_add(1, Ordering::SeqCst);
            let reply = Query::parse(&buf[..n]).unwrap().a_record_response(answer);
            socket.send_to(&reply, peer).await.unwrap();
        }
    });
    (addr, queries)
}

#[tokio::test]
async fn test_dns_forwards_allowed_and_refuses_others() {
    let answer = Ipv4Addr::new(93, 184, 216, 34);
    let (upstream, queries) = fake_resolver(answer).await;
    let h = harness(&[], &["example.com"]).await;

    let ctx = Arc::new(DnsContext {
        allowlist: h.allowlist.clone(),
        audit: Arc::new(AuditLog::new(100)),
        blocker: CidrBlocker::none(),
        upstream,
        timeout: Duration::from_secs(2),
        alias_ip: None,
        shutdown_rx: h.shutdown_rx.clone(),
    });
    let listener = DnsProxyListener::bind("127.0.0.1:0".parse().unwrap(), ctx)
        .await
        .unwrap();
    let dns = listener.local_addr().unwrap();
    tokio::spawn(listener.run());

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = vec![0u8; 512];

    let query = encode_query(0x1111, "example.com", TYPE_A);
    client.send_to(&query, dns).await.unwrap();
    let (n, _) = tokio::time::timeout(STEP, client.recv_from(&mut buf)).await.unwrap().unwrap();
    let expected = Query::parse(&query).unwrap().a_record_response(answer);
    assert_eq!(&buf[..n], &expected[..], "answer relayed verbatim");
    assert_eq!(queries.load(Ordering::SeqCst), 1);

    client
        .send_to(&encode_query(0x2222, "exfil.attacker.example", TYPE_A), dns)
        .await
        .unwrap();
    let (n, _) = tokio::time::timeout(STEP, client.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(rcode_of(&buf[..n]), Some(Rcode::Refused as u8));
    assert_eq!(queries.load(Ordering::SeqCst), 1, "denied name never sent upstream");
}

#[tokio::test]
async fn test_telemetry_ingest_visible_over_control_api() {
    let h = harness(&[], &[]).await;
    let creds = CredentialSet::generate(Duration::from_secs(3600)).unwrap();
    let control = h.control(&creds).await;

    let receiver = TelemetryReceiver::bind(
        "127.0.0.1:0".parse().unwrap(),
        h.telemetry.clone(),
        h.shutdown_rx.clone(),
    )
    .await
    .unwrap();
    let ingest = receiver.local_addr().unwrap();
    tokio::spawn(receiver.run());

    let body = r#"{"agent":"codex","samples":[{"name":"codex.turns","value":2},{"name":"codex.turns","value":3}]}"#;
    let request = format!(
        "POST /v1/metrics HTTP/1.1\r\nHost: {ingest}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let mut stream = TcpStream::connect(ingest).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(STEP, stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200"));

    let client = ControlClient::new(control, creds.client_tls_config().unwrap());
    let metrics = client.metrics().await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].agent, "codex");
    assert_eq!(metrics[0].value, 5.0);
}

#[tokio::test]
async fn test_shutdown_closes_open_tunnels() {
    let (echo, _) = echo_server().await;
    let entry = echo.to_string();
    let h = harness(&[entry.as_str()], &[]).await;

    let (status, mut stream) = connect_via(h.proxy, echo).await;
    assert!(status.starts_with("HTTP/1.1 200"));

    h.shutdown_tx.send(true).unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf))
        .await
        .expect("tunnel must close within the grace period");
    assert!(matches!(read, Ok(0) | Err(_)));
}
