//! egress-warden: Egress-control proxy for sandboxed AI agents
//!
//! This crate provides the network boundary for an AI coding agent running
//! in a network-isolated container. The agent's only ways out are an HTTP
//! forward proxy and a DNS forwarder, both gated by a shared allowlist that
//! the host operator can widen at runtime over a mutually authenticated
//! control API.
//!
//! # Security Model
//!
//! The security model is **fail-closed**: anything not explicitly allowlisted
//! is refused before a connection or upstream query is made. Allowed names
//! that resolve into private or loopback ranges are refused as well.
//!
//! # Architecture
//!
//! - **Policy**: Copy-on-write allowlist store and blocked address ranges
//! - **Proxy**: HTTP forward proxy with CONNECT tunneling
//! - **DNS**: UDP/TCP forwarder that refuses unlisted names locally
//! - **Control**: HTTPS API with client-certificate authentication
//! - **PKI**: In-memory ephemeral CA and short-lived certificates
//! - **Telemetry**: Agent metric/event ingest and aggregation
//! - **Audit**: Bounded log of every allow/block decision
//! - **Server**: Composition root and shutdown handling

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod audit;
pub mod body;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod control;
pub mod dns;
pub mod error;
pub mod pki;
pub mod policy;
pub mod proxy;
pub mod server;
pub mod shutdown;
pub mod telemetry;

pub use error::ErrorKind;
pub use server::{BoundAddrs, BoundServer, ProxyServer};
