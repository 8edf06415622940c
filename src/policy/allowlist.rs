//! Runtime allowlist for HTTP destinations and DNS names.
//!
//! The store holds two independent rule sets:
//! - HTTP destinations as `host:port` (port is always numeric)
//! - DNS query names as a bare `host` (a port is rejected)
//!
//! Granting one never implies the other: `api.example.com:443` in the HTTP set
//! does not make `api.example.com` resolvable through the DNS listener.
//!
//! # Pattern Matching
//!
//! - Exact match: `github.com`
//! - Wildcard match: `*.github.com` matches `api.github.com`, `raw.github.com`
//!   but NOT `github.com` itself
//!
//! Hosts are compared case-insensitively and a trailing root dot is ignored.
//!
//! # Concurrency
//!
//! Readers load an immutable snapshot through [`ArcSwap`] and never block.
//! Writers are serialized by a mutex, build a complete new snapshot, and
//! publish it with a single pointer swap, so a reader sees either all or none
//! of an append.
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::policy::AllowListStore;
//!
//! let store = AllowListStore::new();
//! store.append_http(&["api.example.com:443"])?;
//! assert!(store.check_http("API.example.com", 443));
//! assert!(!store.check_dns("api.example.com"));
//! ```

use super::error::{PolicyError, PolicyResult};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A host pattern from an allowlist entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostPattern {
    /// Matches exactly this (lowercase) host.
    Exact(String),
    /// Matches any strict subdomain of this suffix, written `*.suffix`.
    Subdomains(String),
}

impl HostPattern {
    /// Check a normalized (lowercase, no trailing dot) host against the pattern.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(exact) => exact == host,
            HostPattern::Subdomains(suffix) => is_strict_subdomain(host, suffix),
        }
    }

    fn parse(raw: &str) -> Result<Self, &'static str> {
        if raw.is_empty() {
            return Err("empty host");
        }
        if raw.chars().any(char::is_whitespace) {
            return Err("host contains whitespace");
        }

        let host = normalize_host(raw);
        if host.is_empty() {
            return Err("empty host");
        }

        if let Some(suffix) = host.strip_prefix("*.") {
            if suffix.is_empty() {
                return Err("wildcard without a domain");
            }
            if suffix.contains('*') {
                return Err("wildcard only allowed as a leading '*.'");
            }
            return Ok(HostPattern::Subdomains(suffix.to_string()));
        }

        if host.contains('*') {
            return Err("wildcard only allowed as a leading '*.'");
        }

        Ok(HostPattern::Exact(host))
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Exact(host) => f.write_str(host),
            HostPattern::Subdomains(suffix) => write!(f, "*.{}", suffix),
        }
    }
}

/// A validated HTTP allowlist entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpEntry {
    /// Host or wildcard pattern.
    pub host: HostPattern,
    /// Destination port.
    pub port: u16,
}

impl HttpEntry {
    /// Parse a `host:port` entry. IPv6 literals must be bracketed (`[::1]:443`).
    pub fn parse(entry: &str) -> PolicyResult<Self> {
        let invalid = |reason| PolicyError::InvalidHttpEntry {
            entry: entry.to_string(),
            reason,
        };

        let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
            rest.split_once("]:")
                .ok_or_else(|| invalid("expected [address]:port"))?
        } else {
            let (host, port) = entry.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
            if host.contains(':') {
                return Err(invalid("IPv6 addresses must be bracketed"));
            }
            (host, port)
        };

        if port.is_empty() {
            return Err(invalid("missing port"));
        }
        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("port must be numeric"));
        }
        let port = match port.parse::<u16>() {
            Ok(0) | Err(_) => return Err(invalid("port out of range")),
            Ok(port) => port,
        };

        let host = HostPattern::parse(host).map_err(invalid)?;
        Ok(Self { host, port })
    }
}

impl fmt::Display for HttpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            HostPattern::Exact(host) if host.contains(':') => write!(f, "[{}]:{}", host, self.port),
            host => write!(f, "{}:{}", host, self.port),
        }
    }
}

/// A validated DNS allowlist entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsEntry {
    /// Name or wildcard pattern.
    pub name: HostPattern,
}

impl DnsEntry {
    /// Parse a bare hostname. Any `:` (port or IPv6) is rejected.
    pub fn parse(entry: &str) -> PolicyResult<Self> {
        let invalid = |reason| PolicyError::InvalidDnsEntry {
            entry: entry.to_string(),
            reason,
        };

        if entry.contains(':') {
            return Err(invalid("must not include a port"));
        }
        let name = HostPattern::parse(entry).map_err(invalid)?;
        Ok(Self { name })
    }
}

impl fmt::Display for DnsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

/// Point-in-time copy of both allowlists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListSnapshot {
    /// HTTP entries in insertion order, rendered as `host:port`.
    #[serde(rename = "allow-http")]
    pub http: Vec<String>,
    /// DNS entries in insertion order.
    #[serde(rename = "allow-dns")]
    pub dns: Vec<String>,
}

#[derive(Debug, Default, Clone)]
struct Rules {
    http: Vec<HttpEntry>,
    http_exact: HashSet<(String, u16)>,
    http_wildcards: Vec<(String, u16)>,
    dns: Vec<DnsEntry>,
    dns_exact: HashSet<String>,
    dns_wildcards: Vec<String>,
}

impl Rules {
    fn insert_http(&mut self, entry: HttpEntry) -> bool {
        let fresh = match &entry.host {
            HostPattern::Exact(host) => self.http_exact.insert((host.clone(), entry.port)),
            HostPattern::Subdomains(suffix) => {
                let key = (suffix.clone(), entry.port);
                let fresh = !self.http_wildcards.contains(&key);
                if fresh {
                    self.http_wildcards.push(key);
                }
                fresh
            }
        };
        if fresh {
            self.http.push(entry);
        }
        fresh
    }

    fn insert_dns(&mut self, entry: DnsEntry) -> bool {
        let fresh = match &entry.name {
            HostPattern::Exact(name) => self.dns_exact.insert(name.clone()),
            HostPattern::Subdomains(suffix) => {
                let fresh = !self.dns_wildcards.contains(suffix);
                if fresh {
                    self.dns_wildcards.push(suffix.clone());
                }
                fresh
            }
        };
        if fresh {
            self.dns.push(entry);
        }
        fresh
    }

    fn allows_http(&self, host: &str, port: u16) -> bool {
        if self.http_exact.contains(&(host.to_string(), port)) {
            return true;
        }
        self.http_wildcards
            .iter()
            .any(|(suffix, p)| *p == port && is_strict_subdomain(host, suffix))
    }

    fn allows_dns(&self, name: &str) -> bool {
        if self.dns_exact.contains(name) {
            return true;
        }
        self.dns_wildcards
            .iter()
            .any(|suffix| is_strict_subdomain(name, suffix))
    }
}

/// Concurrency-safe allowlist shared by the proxy listeners and the control API.
#[derive(Debug, Default)]
pub struct AllowListStore {
    rules: ArcSwap<Rules>,
    writer: Mutex<()>,
}

impl AllowListStore {
    /// Create an empty store (everything denied).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with initial entries.
    ///
    /// Fails on the first invalid entry, exactly like a runtime append.
    pub fn with_entries<S: AsRef<str>>(http: &[S], dns: &[S]) -> PolicyResult<Self> {
        let store = Self::new();
        store.append_http(http)?;
        store.append_dns(dns)?;
        Ok(store)
    }

    /// Whether `host:port` is an allowed HTTP destination.
    pub fn check_http(&self, host: &str, port: u16) -> bool {
        let host = normalize_host(host);
        self.rules.load().allows_http(&host, port)
    }

    /// Whether `name` may be resolved through the DNS listener.
    pub fn check_dns(&self, name: &str) -> bool {
        let name = normalize_host(name);
        self.rules.load().allows_dns(&name)
    }

    /// Append HTTP entries, all-or-nothing.
    ///
    /// Every entry is validated before the store is touched; one bad entry
    /// rejects the whole batch. Entries already present are skipped. Returns
    /// the entries that were newly added, in normalized form.
    pub fn append_http<S: AsRef<str>>(&self, entries: &[S]) -> PolicyResult<Vec<String>> {
        let parsed = entries
            .iter()
            .map(|e| HttpEntry::parse(e.as_ref()))
            .collect::<PolicyResult<Vec<_>>>()?;

        let _guard = self.writer.lock();
        let mut next = Rules::clone(&self.rules.load());
        let mut added = Vec::new();
        for entry in parsed {
            let rendered = entry.to_string();
            if next.insert_http(entry) {
                added.push(rendered);
            }
        }

        if added.is_empty() {
            debug!("HTTP allowlist append changed nothing");
        } else {
            self.rules.store(Arc::new(next));
            info!("Added HTTP allowlist entries: {:?}", added);
        }
        Ok(added)
    }

    /// Append DNS entries, all-or-nothing. See [`AllowListStore::append_http`].
    pub fn append_dns<S: AsRef<str>>(&self, entries: &[S]) -> PolicyResult<Vec<String>> {
        let parsed = entries
            .iter()
            .map(|e| DnsEntry::parse(e.as_ref()))
            .collect::<PolicyResult<Vec<_>>>()?;

        let _guard = self.writer.lock();
        let mut next = Rules::clone(&self.rules.load());
        let mut added = Vec::new();
        for entry in parsed {
            let rendered = entry.to_string();
            if next.insert_dns(entry) {
                added.push(rendered);
            }
        }

        if added.is_empty() {
            debug!("DNS allowlist append changed nothing");
        } else {
            self.rules.store(Arc::new(next));
            info!("Added DNS allowlist entries: {:?}", added);
        }
        Ok(added)
    }

    /// Copy both entry lists.
    pub fn snapshot(&self) -> AllowListSnapshot {
        let rules = self.rules.load();
        AllowListSnapshot {
            http: rules.http.iter().map(ToString::to_string).collect(),
            dns: rules.dns.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Lowercase a host and drop brackets and a trailing root dot.
pub fn normalize_host(host: &str) -> String {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_strict_subdomain(host: &str, suffix: &str) -> bool {
    if !host.ends_with(suffix) {
        return false;
    }
    let prefix_len = host.len() - suffix.len();
    prefix_len > 1 && host.as_bytes()[prefix_len - 1] == b'.'
}
