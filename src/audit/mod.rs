//! Audit trail of allow/block decisions made by the proxy listeners.
//!
//! Every decision is also emitted through `tracing`; the in-memory
//! [`AuditLog`] exists so the operator can page through recent decisions
//! over the control API.
//!
//! # Usage
//!
//! ```ignore
//! use egress_warden::audit::{Action, AuditLog, Reason, Source};
//!
//! let log = AuditLog::default();
//! log.record("example.com", Some(443), Action::Block, Source::Proxy, Reason::NotAllowlisted);
//! let recent = log.entries_after(0);
//! ```

mod events;
mod log;

pub use events::{Action, DomainStats, LogEntry, Reason, Source};
pub use log::{AuditLog, DEFAULT_LOG_CAPACITY, DEFAULT_MAX_DOMAINS, INITIAL_TAIL, OTHER_DOMAINS};
