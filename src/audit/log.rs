//! Bounded in-memory log of policy decisions.
//!
//! The log keeps the most recent entries in a ring buffer and per-domain
//! counters for every decision ever recorded. The control API serves both.
//! Counters are kept for at most [`DEFAULT_MAX_DOMAINS`] names; decisions for
//! names first seen after that are counted under [`OTHER_DOMAINS`].

use super::events::{Action, DomainStats, LogEntry, Reason, Source};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info};

/// Default number of entries retained.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// Entries returned when a reader asks for everything after id 0.
pub const INITIAL_TAIL: usize = 25;

/// Default number of distinct domains with their own counters.
pub const DEFAULT_MAX_DOMAINS: usize = 10_000;

/// Counter key for domains beyond the per-domain limit.
pub const OTHER_DOMAINS: &str = "(other)";

struct Inner {
    entries: VecDeque<LogEntry>,
    next_id: u64,
    stats: BTreeMap<String, DomainStats>,
}

/// Thread-safe decision log shared by the listeners.
pub struct AuditLog {
    capacity: usize,
    max_domains: usize,
    inner: Mutex<Inner>,
}

impl AuditLog {
    /// Create a log retaining at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self::with_limits(capacity, DEFAULT_MAX_DOMAINS)
    }

    /// Like [`AuditLog::new`], also capping how many domains get their own
    /// counters (minimum 1).
    pub fn with_limits(capacity: usize, max_domains: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            max_domains: max_domains.max(1),
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                next_id: 1,
                stats: BTreeMap::new(),
            }),
        }
    }

    /// Record a decision and return its id.
    pub fn record(
        &self,
        domain: &str,
        port: Option<u16>,
        action: Action,
        source: Source,
        reason: Reason,
    ) -> u64 {
        match action {
            Action::Allow => debug!(?source, ?reason, port, "allow {}", domain),
            Action::Block => info!(?source, ?reason, port, "block {}", domain),
        }

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let key = if inner.stats.contains_key(domain) || inner.stats.len() < self.max_domains {
            domain
        } else {
            OTHER_DOMAINS
        };
        let stats = inner.stats.entry(key.to_string()).or_default();
        match action {
            Action::Allow => stats.allowed += 1,
            Action::Block => stats.blocked += 1,
        }

        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LogEntry {
            id,
            time: Utc::now(),
            domain: domain.to_string(),
            port,
            action,
            source,
            reason,
        });
        id
    }

    /// Entries with id greater than `after`, oldest first.
    ///
    /// `after == 0` returns only the most recent [`INITIAL_TAIL`] entries so a
    /// new reader does not pull the whole buffer.
    pub fn entries_after(&self, after: u64) -> Vec<LogEntry> {
        let inner = self.inner.lock();
        if after == 0 {
            let skip = inner.entries.len().saturating_sub(INITIAL_TAIL);
            return inner.entries.iter().skip(skip).cloned().collect();
        }
        inner
            .entries
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect()
    }

    /// Per-domain counters, sorted by domain.
    pub fn stats(&self) -> BTreeMap<String, DomainStats> {
        self.inner.lock().stats.clone()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(log: &AuditLog, domain: &str) -> u64 {
        log.record(domain, Some(443), Action::Block, Source::Proxy, Reason::NotAllowlisted)
    }

    #[test]
    fn test_ids_are_sequential() {
        let log = AuditLog::new(10);
        assert_eq!(block(&log, "a.com"), 1);
        assert_eq!(block(&log, "b.com"), 2);
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            block(&log, &format!("d{}.com", i));
        }
        let ids: Vec<u64> = log.entries_after(0).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_entries_after() {
        let log = AuditLog::new(100);
        for _ in 0..40 {
            block(&log, "x.com");
        }
        assert_eq!(log.entries_after(0).len(), INITIAL_TAIL);
        assert_eq!(log.entries_after(0)[0].id, 16);
        assert_eq!(log.entries_after(35).len(), 5);
        assert!(log.entries_after(40).is_empty());
    }

    #[test]
    fn test_stats_survive_eviction() {
        let log = AuditLog::new(1);
        block(&log, "x.com");
        log.record("x.com", None, Action::Allow, Source::Dns, Reason::Allowlisted);
        block(&log, "y.com");

        let stats = log.stats();
        assert_eq!(stats["x.com"], DomainStats { allowed: 1, blocked: 1 });
        assert_eq!(stats["y.com"].blocked, 1);
    }

    #[test]
    fn test_stats_domain_limit() {
        let log = AuditLog::with_limits(10, 3);
        block(&log, "a.com");
        block(&log, "b.com");
        for i in 0..50 {
            block(&log, &format!("random{}.attacker.example", i));
        }
        block(&log, "a.com");

        let stats = log.stats();
        assert_eq!(stats.len(), 4);
        assert_eq!(stats["a.com"].blocked, 2);
        assert_eq!(stats["random0.attacker.example"].blocked, 1);
        assert_eq!(stats[OTHER_DOMAINS].blocked, 49);
    }
}
