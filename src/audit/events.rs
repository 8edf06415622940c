//! Audit record types for allow/block decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Request was forwarded.
    Allow,
    /// Request was refused without contacting upstream.
    Block,
}

/// Listener that made the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// HTTP forward proxy (plain or CONNECT).
    Proxy,
    /// DNS listener.
    Dns,
}

/// Why a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Matched an allowlist entry.
    Allowlisted,
    /// No allowlist entry matched.
    NotAllowlisted,
    /// Destination resolved into a blocked address range.
    BlockedAddress,
    /// Reserved host-gateway alias on an allowed host port.
    HostGateway,
}

/// A single allow/block decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic id, starting at 1.
    pub id: u64,
    /// When the decision was made.
    pub time: DateTime<Utc>,
    /// Requested host or query name.
    pub domain: String,
    /// Requested port (absent for DNS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Allow or block.
    pub action: Action,
    /// Which listener decided.
    pub source: Source,
    /// Why.
    pub reason: Reason,
}

/// Per-domain decision counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStats {
    /// Number of allowed requests.
    pub allowed: u64,
    /// Number of blocked requests.
    pub blocked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_serialization() {
        let entry = LogEntry {
            id: 7,
            time: Utc::now(),
            domain: "example.com".to_string(),
            port: None,
            action: Action::Block,
            source: Source::Dns,
            reason: Reason::NotAllowlisted,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["action"], "block");
        assert_eq!(json["source"], "dns");
        assert_eq!(json["reason"], "not_allowlisted");
        assert!(json.get("port").is_none());
    }
}
