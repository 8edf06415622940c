//! Configuration system for the egress proxy.
//!
//! This module provides JSON configuration loading and validation plus the
//! environment-supplied TLS material for the control API.
//!
//! # Sources
//!
//! 1. Built-in defaults
//! 2. Config file (via `--config` flag), replacing defaults field by field
//! 3. `EGRESS_PROXY_TLS_KEY`, `EGRESS_PROXY_TLS_CERT`, `EGRESS_PROXY_CA_CERT`
//!
//! If no TLS variable is set the control API is disabled. A partial set is
//! a startup error.

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{CA_CERT_ENV, ConfigLoader, TLS_CERT_ENV, TLS_KEY_ENV, TlsMaterial};
pub use schema::{
    DEFAULT_CONTROL_API_PORT, DEFAULT_DNS_PORT, DEFAULT_PROXY_PORT, DEFAULT_UPSTREAM, ProxyConfig,
};
