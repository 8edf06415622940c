//! Ring buffer of agent telemetry events.

use super::model::{EventRecord, TelemetryEvent, limit_attributes};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default number of events retained.
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// Events returned when a reader asks for everything after id 0.
const INITIAL_TAIL: usize = 25;

struct Inner {
    events: VecDeque<TelemetryEvent>,
    next_id: u64,
}

/// Bounded, thread-safe event store.
pub struct EventBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl EventBuffer {
    /// Create a buffer retaining at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                next_id: 1,
            }),
        }
    }

    /// Store an event, returning its id. Empty names are ignored.
    pub fn push(&self, agent: &str, record: EventRecord) -> Option<u64> {
        if record.name.is_empty() {
            return None;
        }

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.events.len() == self.capacity {
            inner.events.pop_front();
        }
        inner.events.push_back(TelemetryEvent {
            id,
            time: Utc::now(),
            agent: agent.to_string(),
            event_name: record.name,
            attrs: limit_attributes(record.attributes),
        });
        Some(id)
    }

    /// Events newer than `after`, optionally for one agent, oldest first.
    ///
    /// `after == 0` returns only the latest few events.
    pub fn events_after(&self, after: u64, agent: Option<&str>) -> Vec<TelemetryEvent> {
        let inner = self.inner.lock();
        let matching: Vec<&TelemetryEvent> = inner
            .events
            .iter()
            .filter(|e| e.id > after)
            .filter(|e| agent.is_none_or(|a| e.agent == a))
            .collect();

        let skip = if after == 0 {
            matching.len().saturating_sub(INITIAL_TAIL)
        } else {
            0
        };
        matching.into_iter().skip(skip).cloned().collect()
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(name: &str) -> EventRecord {
        EventRecord {
            name: name.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_push_assigns_ids() {
        let buf = EventBuffer::new(10);
        assert_eq!(buf.push("a", record("x")), Some(1));
        assert_eq!(buf.push("a", record("")), None);
        assert_eq!(buf.push("a", record("y")), Some(2));
    }

    #[test]
    fn test_events_after_filters_by_agent() {
        let buf = EventBuffer::new(100);
        for i in 0..10 {
            let agent = if i % 2 == 0 { "claude" } else { "codex" };
            buf.push(agent, record("e"));
        }
        let codex = buf.events_after(0, Some("codex"));
        assert_eq!(codex.len(), 5);
        assert!(codex.iter().all(|e| e.agent == "codex"));
        assert_eq!(buf.events_after(8, None).len(), 2);
    }

    #[test]
    fn test_initial_tail_and_eviction() {
        let buf = EventBuffer::new(30);
        for _ in 0..40 {
            buf.push("a", record("e"));
        }
        let tail = buf.events_after(0, None);
        assert_eq!(tail.len(), 25);
        assert_eq!(tail.last().unwrap().id, 40);
        assert_eq!(buf.events_after(1, None).first().unwrap().id, 11);
    }
}
