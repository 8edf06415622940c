//! HTTP forward proxy with allowlist enforcement.
//!
//! This module provides the sandbox's only HTTP egress path:
//! - HTTP CONNECT handling for HTTPS tunneling (opaque, no interception)
//! - Plain absolute-URI request forwarding
//! - Allowlist checks before any resolution or dial
//! - Blocked-range checks on resolved addresses
//! - Optional host-gateway alias for reaching services on the host
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │   Sandbox (isolated network) │
//! │  ┌─────────────┐             │
//! │  │    Agent    │─────────┐   │
//! │  └─────────────┘         │   │
//! │        HTTP(S)_PROXY     ▼   │
//! │                  ┌──────────────┐
//! │                  │ egress-proxy │──── allowlist ──► 403
//! │                  └──────┬───────┘
//! └─────────────────────────┼────┘
//!                           ▼
//!                    ┌──────────────┐
//!                    │   Internet   │
//!                    └──────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::proxy::{Dialer, HttpProxyListener, ProxyContext};
//!
//! let ctx = Arc::new(ProxyContext {
//!     allowlist,
//!     audit,
//!     dialer: Dialer::new(blocker, DEFAULT_DIAL_TIMEOUT),
//!     host_gateway: None,
//!     shutdown_rx,
//! });
//! HttpProxyListener::bind(addr, ctx).await?.run().await?;
//! ```

pub mod connect;
pub mod error;
pub mod forward;
pub mod server;
pub mod upstream;

// Re-export main types for convenient access
pub use error::{ProxyError, ProxyResult};
pub use server::HttpProxyListener;
pub use upstream::{DEFAULT_DIAL_TIMEOUT, Dialer, HOST_GATEWAY_ALIAS, HostGateway, ProxyContext};
