//! Lifecycle events and trigger pattern matching.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use wiggum_core::EventKind;

/// Events kept for inspection.
pub const EVENT_HISTORY: usize = 100;

/// One emitted lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub kind: EventKind,
    pub service_id: String,
    pub timestamp: i64,
}

impl ServiceEvent {
    pub fn new(kind: EventKind, service_id: &str, timestamp: i64) -> Self {
        Self {
            kind,
            service_id: service_id.to_string(),
            timestamp,
        }
    }

    /// `service.<kind>:<id>`
    pub fn name(&self) -> String {
        self.kind.event_name(&self.service_id)
    }
}

/// Events emitted by one finished execution: `completed` always, then
/// `succeeded` or `failed`.
pub fn events_for(service_id: &str, success: bool, timestamp: i64) -> Vec<ServiceEvent> {
    let outcome = if success { EventKind::Succeeded } else { EventKind::Failed };
    vec![
        ServiceEvent::new(EventKind::Completed, service_id, timestamp),
        ServiceEvent::new(outcome, service_id, timestamp),
    ]
}

/// Exact match, or prefix match when the pattern ends in `*`.
pub fn pattern_matches(pattern: &str, event: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => event.starts_with(prefix),
        None => pattern == event,
    }
}

/// True when any pattern matches any of the event names.
pub fn any_match(patterns: &[String], events: &[String]) -> bool {
    patterns
        .iter()
        .any(|p| events.iter().any(|e| pattern_matches(p, e)))
}

/// Bounded history of recent events, oldest first.
#[derive(Debug, Clone)]
pub struct EventLog {
    events: VecDeque<ServiceEvent>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(EVENT_HISTORY)
    }
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(EVENT_HISTORY)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, event: ServiceEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn recent(&self) -> Vec<ServiceEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
