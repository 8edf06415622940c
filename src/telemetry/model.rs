//! Telemetry wire and summary types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent name used when a batch does not identify its sender.
pub const UNKNOWN_AGENT: &str = "unknown";

/// Maximum attributes kept per sample or event.
pub const MAX_ATTRIBUTES: usize = 64;

/// Maximum attribute value length in bytes.
pub const MAX_ATTRIBUTE_VALUE_LEN: usize = 256;

/// How repeated samples of one series combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Counter increment; values add up.
    #[default]
    Sum,
    /// Point-in-time measurement; the latest value wins.
    Gauge,
}

/// One measurement reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Metric name, e.g. `claude_code.token.usage`.
    pub name: String,
    /// Numeric value.
    pub value: f64,
    /// Combination rule.
    #[serde(default)]
    pub kind: MetricKind,
    /// Dimensions such as `model` or `type`.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// `POST /v1/metrics` request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricBatch {
    /// Reporting agent; defaults to [`UNKNOWN_AGENT`].
    #[serde(default)]
    pub agent: Option<String>,
    /// Samples in this batch.
    pub samples: Vec<MetricSample>,
}

/// Accumulated value for one `(agent, name, attributes)` series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Metric name. Never empty.
    pub name: String,
    /// Reporting agent.
    pub agent: String,
    /// Sum for counters, latest value for gauges.
    pub value: f64,
    /// Series dimensions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// One event as submitted by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event name, e.g. `claude_code.tool_result`.
    pub name: String,
    /// Event attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// `POST /v1/events` request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Reporting agent; defaults to [`UNKNOWN_AGENT`].
    #[serde(default)]
    pub agent: Option<String>,
    /// Events in this batch.
    pub events: Vec<EventRecord>,
}

/// A stored event with its buffer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Monotonic id, starting at 1.
    pub id: u64,
    /// Receive time.
    pub time: DateTime<Utc>,
    /// Reporting agent.
    pub agent: String,
    /// Event name.
    pub event_name: String,
    /// Event attributes after limits were applied.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

/// Resolve an optional agent name, treating blank as unknown.
pub fn agent_or_unknown(agent: Option<&str>) -> String {
    match agent.map(str::trim) {
        Some(a) if !a.is_empty() => a.to_string(),
        _ => UNKNOWN_AGENT.to_string(),
    }
}

/// Keep at most [`MAX_ATTRIBUTES`] attributes and truncate long values.
pub fn limit_attributes(attrs: BTreeMap<String, String>) -> BTreeMap<String, String> {
    attrs
        .into_iter()
        .take(MAX_ATTRIBUTES)
        .map(|(k, v)| (k, truncate_utf8(v, MAX_ATTRIBUTE_VALUE_LEN)))
        .collect()
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 character.
pub fn truncate_utf8(mut s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}
