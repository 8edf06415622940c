//! Filtering DNS listener.
//!
//! Serves UDP and TCP on the same port. Each query is checked against the
//! DNS allowlist before anything is sent upstream:
//!
//! - Denied names get `REFUSED` and never reach the upstream resolver
//! - The host-gateway alias is answered locally with a synthetic A record
//! - Allowed queries are forwarded verbatim over the transport they arrived
//!   on, with a deadline; timeouts and upstream errors become `SERVFAIL`
//! - Answers pointing into a blocked address range become `NXDOMAIN`
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::dns::{DnsContext, DnsProxyListener};
//!
//! let listener = DnsProxyListener::bind("0.0.0.0:53".parse()?, Arc::new(ctx)).await?;
//! tokio::spawn(listener.run());
//! ```

use super::error::{DnsError, DnsResult};
use super::wire::{Query, Rcode, TYPE_A, answer_addresses, header_only_response, message_id};
use crate::audit::{Action, AuditLog, Reason, Source};
use crate::policy::{AllowListStore, CidrBlocker};
use crate::proxy::HOST_GATEWAY_ALIAS;
use crate::shutdown::{self, DEFAULT_GRACE, ShutdownRx};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default deadline for an upstream exchange.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_UDP_MESSAGE: usize = 65_535;
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport a query arrived on. Upstream exchanges use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Datagram.
    Udp,
    /// Length-prefixed stream.
    Tcp,
}

/// State shared by every DNS query.
pub struct DnsContext {
    /// DNS allowlist.
    pub allowlist: Arc<AllowListStore>,
    /// Decision log.
    pub audit: Arc<AuditLog>,
    /// Address ranges answers may not point into.
    pub blocker: CidrBlocker,
    /// Upstream resolver.
    pub upstream: SocketAddr,
    /// Deadline for each upstream exchange.
    pub timeout: Duration,
    /// Address answered for the host-gateway alias, if enabled.
    pub alias_ip: Option<Ipv4Addr>,
    /// Shutdown signal.
    pub shutdown_rx: ShutdownRx,
}

impl DnsContext {
    /// Produce the reply for one client message.
    ///
    /// Returns `None` only when the message is too short to carry an id, in
    /// which case nothing can be sent back.
    pub async fn answer(&self, msg: &[u8], transport: Transport) -> Option<Vec<u8>> {
        let query = match Query::parse(msg) {
            Ok(query) => query,
            Err(e) => {
                debug!("Rejecting DNS message: {}", e);
                return header_only_response(msg, Rcode::FormErr);
            }
        };

        let Some(question) = query.question.as_ref() else {
            return Some(query.response(Rcode::ServFail));
        };
        let name = question.name.as_str();

        if let Some(ip) = self.alias_ip.filter(|_| name == HOST_GATEWAY_ALIAS) {
            self.audit
                .record(name, None, Action::Allow, Source::Dns, Reason::HostGateway);
            return Some(if question.qtype == TYPE_A {
                query.a_record_response(ip)
            } else {
                query.response(Rcode::NoError)
            });
        }

        if !self.allowlist.check_dns(name) {
            self.audit
                .record(name, None, Action::Block, Source::Dns, Reason::NotAllowlisted);
            return Some(query.response(Rcode::Refused));
        }

        let reply = match self.exchange(msg, transport).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("DNS query for {} failed: {}", name, e);
                return Some(query.response(Rcode::ServFail));
            }
        };

        match answer_addresses(&reply) {
            Ok(addrs) => {
                if let Some(blocked) = addrs.iter().find(|ip| self.blocker.is_blocked(**ip)) {
                    info!("{} resolves to blocked address {}", name, blocked);
                    self.audit
                        .record(name, None, Action::Block, Source::Dns, Reason::BlockedAddress);
                    return Some(query.response(Rcode::NxDomain));
                }
            }
            Err(e) => {
                warn!("Unreadable upstream answer for {}: {}", name, e);
                return Some(query.response(Rcode::ServFail));
            }
        }

        self.audit
            .record(name, None, Action::Allow, Source::Dns, Reason::Allowlisted);
        Some(reply)
    }

    async fn exchange(&self, msg: &[u8], transport: Transport) -> DnsResult<Vec<u8>> {
        let exchange = async {
            match transport {
                Transport::Udp => self.exchange_udp(msg).await,
                Transport::Tcp => self.exchange_tcp(msg).await,
            }
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| DnsError::Timeout {
                upstream: self.upstream,
            })?
    }

    async fn exchange_udp(&self, msg: &[u8]) -> DnsResult<Vec<u8>> {
        let local: SocketAddr = match self.upstream.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.upstream).await?;
        socket.send(msg).await?;

        let id = message_id(msg);
        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        loop {
            let n = socket.recv(&mut buf).await?;
            if message_id(&buf[..n]) == id {
                buf.truncate(n);
                return Ok(buf);
            }
            debug!("Dropping upstream reply with unexpected id");
        }
    }

    async fn exchange_tcp(&self, msg: &[u8]) -> DnsResult<Vec<u8>> {
        let mut stream = TcpStream::connect(self.upstream).await?;
        write_framed(&mut stream, msg).await?;
        let mismatch = || DnsError::Mismatch {
            upstream: self.upstream,
        };
        let reply = read_framed(&mut stream).await?.ok_or_else(mismatch)?;
        if message_id(&reply) != message_id(msg) {
            return Err(mismatch());
        }
        Ok(reply)
    }
}

/// Read one length-prefixed DNS message. `None` on clean end of stream.
pub async fn read_framed<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u16().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one length-prefixed DNS message.
pub async fn write_framed<W: AsyncWrite + Unpin>(writer: &mut W, msg: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(msg.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "DNS message too long")
    })?;
    writer.write_u16(len).await?;
    writer.write_all(msg).await?;
    writer.flush().await
}

/// The DNS listener, bound to UDP and TCP on one port.
pub struct DnsProxyListener {
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
    ctx: Arc<DnsContext>,
}

impl DnsProxyListener {
    /// Bind UDP on `addr`, then TCP on the port UDP actually got.
    pub async fn bind(addr: SocketAddr, ctx: Arc<DnsContext>) -> DnsResult<Self> {
        let udp = UdpSocket::bind(addr)
            .await
            .map_err(|source| DnsError::Bind { addr, source })?;
        let bound = udp.local_addr()?;
        let tcp = TcpListener::bind(bound)
            .await
            .map_err(|source| DnsError::Bind { addr: bound, source })?;
        Ok(Self {
            udp: Arc::new(udp),
            tcp,
            ctx,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> DnsResult<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// Serve both transports until shutdown is signalled.
    pub async fn run(self) -> DnsResult<()> {
        info!("DNS proxy listening on {} (udp+tcp)", self.local_addr()?);

        let mut shutdown_rx = self.ctx.shutdown_rx.clone();
        let mut tasks = JoinSet::new();
        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        loop {
            tokio::select! {
                recv = self.udp.recv_from(&mut buf) => {
                    match recv {
                        Ok((n, peer)) => {
                            let msg = buf[..n].to_vec();
                            let ctx = self.ctx.clone();
                            let socket = self.udp.clone();
                            tasks.spawn(async move {
                                if let Some(reply) = ctx.answer(&msg, Transport::Udp).await
                                    && let Err(e) = socket.send_to(&reply, peer).await
                                {
                                    debug!("Failed to reply to {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => debug!("UDP receive error: {}", e),
                    }
                }
                accept = self.tcp.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            debug!("Accepted DNS TCP connection from {}", peer);
                            let ctx = self.ctx.clone();
                            tasks.spawn(async move {
                                if let Err(e) = handle_tcp(stream, ctx).await {
                                    debug!("DNS TCP connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => warn!("Failed to accept DNS connection: {}", e),
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown::signalled(&mut shutdown_rx) => {
                    info!("DNS proxy shutting down");
                    break;
                }
            }
        }

        shutdown::drain(&mut tasks, DEFAULT_GRACE, "dns").await;
        Ok(())
    }
}

async fn handle_tcp(mut stream: TcpStream, ctx: Arc<DnsContext>) -> DnsResult<()> {
    let mut shutdown_rx = ctx.shutdown_rx.clone();
    loop {
        let msg = tokio::select! {
            read = tokio::time::timeout(TCP_IDLE_TIMEOUT, read_framed(&mut stream)) => match read {
                Ok(Ok(Some(msg))) => msg,
                Ok(Ok(None)) | Err(_) => break,
                Ok(Err(e)) => return Err(e.into()),
            },
            _ = shutdown::signalled(&mut shutdown_rx) => break,
        };

        match ctx.answer(&msg, Transport::Tcp).await {
            Some(reply) => write_framed(&mut stream, &reply).await?,
            None => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::wire::{HEADER_LEN, TYPE_AAAA, encode_query, rcode_of};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    /// Upstream on UDP and TCP answering every query with one A record.
    struct FakeUpstream {
        addr: SocketAddr,
        queries: Arc<AtomicUsize>,
    }

    async fn fake_upstream(answer: Ipv4Addr) -> FakeUpstream {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = udp.local_addr().unwrap();
        let tcp = TcpListener::bind(addr).await.unwrap();
        let queries = Arc::new(AtomicUsize::new(0));

        let counter = queries.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            while let Ok((n, peer)) = udp.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = Query::parse(&buf[..n]).unwrap().a_record_response(answer);
                udp.send_to(&reply, peer).await.unwrap();
            }
        });

        let counter = queries.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = tcp.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let msg = read_framed(&mut stream).await.unwrap().unwrap();
                let reply = Query::parse(&msg).unwrap().a_record_response(answer);
                write_framed(&mut stream, &reply).await.unwrap();
            }
        });

        FakeUpstream { addr, queries }
    }

    fn context(upstream: SocketAddr, allow: &[&str], blocker: CidrBlocker) -> DnsContext {
        DnsContext {
            allowlist: Arc::new(AllowListStore::with_entries::<&str>(&[], allow).unwrap()),
            audit: Arc::new(AuditLog::new(100)),
            blocker,
            upstream,
            timeout: Duration::from_millis(500),
            alias_ip: None,
            shutdown_rx: watch::channel(false).1,
        }
    }

    #[tokio::test]
    async fn test_allowed_query_forwarded() {
        let upstream = fake_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
        let ctx = context(upstream.addr, &["example.com"], CidrBlocker::none());

        let reply = ctx
            .answer(&encode_query(42, "example.com", TYPE_A), Transport::Udp)
            .await
            .unwrap();
        assert_eq!(message_id(&reply), Some(42));
        assert_eq!(rcode_of(&reply), Some(0));
        assert_eq!(
            answer_addresses(&reply).unwrap(),
            vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]
        );
        assert_eq!(upstream.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_query_never_forwarded() {
        let upstream = fake_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
        let ctx = context(upstream.addr, &["example.com"], CidrBlocker::none());

        let reply = ctx
            .answer(&encode_query(7, "evil.example", TYPE_A), Transport::Udp)
            .await
            .unwrap();
        assert_eq!(rcode_of(&reply), Some(Rcode::Refused as u8));
        assert_eq!(upstream.queries.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.audit.entries_after(0)[0].action, Action::Block);
    }

    #[tokio::test]
    async fn test_upstream_timeout_is_servfail() {
        // Bound but never read, so queries go unanswered
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ctx = context(silent.local_addr().unwrap(), &["example.com"], CidrBlocker::none());

        let reply = ctx
            .answer(&encode_query(1, "example.com", TYPE_A), Transport::Udp)
            .await
            .unwrap();
        assert_eq!(rcode_of(&reply), Some(Rcode::ServFail as u8));
    }

    #[tokio::test]
    async fn test_blocked_answer_is_nxdomain() {
        let upstream = fake_upstream(Ipv4Addr::new(10, 1, 2, 3)).await;
        let blocker = CidrBlocker::with_defaults::<&str>(&[]).unwrap();
        let ctx = context(upstream.addr, &["internal.example"], blocker);

        let reply = ctx
            .answer(&encode_query(3, "internal.example", TYPE_A), Transport::Udp)
            .await
            .unwrap();
        assert_eq!(rcode_of(&reply), Some(Rcode::NxDomain as u8));
        assert_eq!(ctx.audit.entries_after(0)[0].reason, Reason::BlockedAddress);
    }

    #[tokio::test]
    async fn test_host_gateway_alias_answered_locally() {
        let upstream = fake_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
        let mut ctx = context(upstream.addr, &[], CidrBlocker::none());
        ctx.alias_ip = Some(Ipv4Addr::new(172, 20, 0, 1));

        let reply = ctx
            .answer(&encode_query(5, HOST_GATEWAY_ALIAS, TYPE_A), Transport::Udp)
            .await
            .unwrap();
        assert_eq!(
            answer_addresses(&reply).unwrap(),
            vec![IpAddr::V4(Ipv4Addr::new(172, 20, 0, 1))]
        );

        let reply = ctx
            .answer(&encode_query(6, HOST_GATEWAY_ALIAS, TYPE_AAAA), Transport::Udp)
            .await
            .unwrap();
        assert_eq!(rcode_of(&reply), Some(0));
        assert!(answer_addresses(&reply).unwrap().is_empty());
        assert_eq!(upstream.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_query_is_formerr() {
        let ctx = context("127.0.0.1:9".parse().unwrap(), &[], CidrBlocker::none());
        let mut msg = encode_query(11, "example.com", TYPE_A);
        msg.truncate(14);
        let reply = ctx.answer(&msg, Transport::Udp).await.unwrap();
        assert_eq!(rcode_of(&reply), Some(Rcode::FormErr as u8));
        assert!(ctx.answer(&[0, 1, 2], Transport::Udp).await.is_none());
    }

    #[tokio::test]
    async fn test_dotted_label_is_formerr_and_not_forwarded() {
        let upstream = fake_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
        let ctx = context(upstream.addr, &["allowed.com"], CidrBlocker::none());

        // One 11-byte label "allowed.com", not the two labels "allowed" and "com"
        let mut msg = encode_query(12, "x", TYPE_A);
        msg.truncate(HEADER_LEN);
        msg.push(11);
        msg.extend_from_slice(b"allowed.com");
        msg.extend_from_slice(&[0, 0, 1, 0, 1]);

        let reply = ctx.answer(&msg, Transport::Udp).await.unwrap();
        assert_eq!(rcode_of(&reply), Some(Rcode::FormErr as u8));
        assert_eq!(upstream.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listener_serves_udp_and_tcp() {
        let upstream = fake_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut ctx = context(upstream.addr, &["example.com"], CidrBlocker::none());
        ctx.shutdown_rx = shutdown_rx;

        let listener = DnsProxyListener::bind("127.0.0.1:0".parse().unwrap(), Arc::new(ctx))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(listener.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&encode_query(21, "example.com", TYPE_A), addr)
            .await
            .unwrap();
        let mut buf = vec![0u8; 512];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(message_id(&buf[..n]), Some(21));
        assert_eq!(rcode_of(&buf[..n]), Some(0));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_framed(&mut stream, &encode_query(22, "evil.example", TYPE_A))
            .await
            .unwrap();
        let reply = read_framed(&mut stream).await.unwrap().unwrap();
        assert_eq!(message_id(&reply), Some(22));
        assert_eq!(rcode_of(&reply), Some(Rcode::Refused as u8));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
