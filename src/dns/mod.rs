//! Filtering DNS forwarder.
//!
//! The sandbox's resolver points here. Names on the DNS allowlist are
//! forwarded to the configured upstream; everything else is refused
//! locally so lookups for unlisted domains never leave the host.
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::dns::{DnsContext, DnsProxyListener, DEFAULT_UPSTREAM_TIMEOUT};
//!
//! let ctx = Arc::new(DnsContext {
//!     allowlist,
//!     audit,
//!     blocker,
//!     upstream: "9.9.9.9:53".parse()?,
//!     timeout: DEFAULT_UPSTREAM_TIMEOUT,
//!     alias_ip: None,
//!     shutdown_rx,
//! });
//! DnsProxyListener::bind(addr, ctx).await?.run().await?;
//! ```

pub mod error;
pub mod server;
pub mod wire;

pub use error::{DnsError, DnsResult};
pub use server::{DEFAULT_UPSTREAM_TIMEOUT, DnsContext, DnsProxyListener, Transport};
