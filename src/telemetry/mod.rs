//! Agent telemetry: ingest, aggregation, and display formatting.
//!
//! # Architecture
//!
//! - **Ingest** ([`TelemetryReceiver`]): plain HTTP inside the sandbox network
//! - **Storage** ([`TelemetryStore`]): a [`MetricAggregator`] plus an [`EventBuffer`]
//! - **Retrieval**: `GET /telemetry/metrics` and `GET /telemetry/events` on the
//!   mTLS control API
//! - **Display** ([`FormatterTable`]): host-side text rendering per agent
//!
//! # Usage
//!
//! ```ignore
//! use egress_warden::telemetry::{MetricKind, MetricSample, TelemetryStore};
//!
//! let store = TelemetryStore::default();
//! store.metrics.record("claude", MetricSample {
//!     name: "claude_code.cost.usage".into(),
//!     value: 0.12,
//!     kind: MetricKind::Sum,
//!     attributes: Default::default(),
//! });
//! for summary in store.metrics.summaries() {
//!     println!("{} {} = {}", summary.agent, summary.name, summary.value);
//! }
//! ```

pub mod aggregator;
mod error;
pub mod events;
pub mod format;
pub mod model;
pub mod receiver;

pub use aggregator::{DEFAULT_MAX_SERIES, MetricAggregator};
pub use error::TelemetryError;
pub use events::{DEFAULT_EVENT_CAPACITY, EventBuffer};
pub use format::{FormatFn, FormatterTable, MetricFamily};
pub use model::{
    EventBatch, EventRecord, MetricBatch, MetricKind, MetricSample, MetricSummary,
    TelemetryEvent, UNKNOWN_AGENT,
};
pub use receiver::TelemetryReceiver;

/// Shared telemetry state handed to the receiver and the control API.
#[derive(Default)]
pub struct TelemetryStore {
    /// Accumulated metric series.
    pub metrics: MetricAggregator,
    /// Recent events.
    pub events: EventBuffer,
}
