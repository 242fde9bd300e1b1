// Event Ledger
//
// Append-only per-aggregate event log with a global monotonic sequence and
// optimistic version control. Used for audit trails and event-sourced
// replay of key activity.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// A recorded event. Sequence is globally monotonic, version is monotonic
/// per aggregate. Neither counter is ever rewound, even across eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: String,
    pub sequence: u64,
    pub aggregate_id: String,
    pub event_type: String,
    pub version: u64,
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

/// Input for a batch append.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub expected_version: Option<u64>,
}

/// Query over the ledger. All filters are conjunctive; results are ordered
/// by ascending sequence.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub aggregate_id: Option<String>,
    pub event_type: Option<String>,
    pub event_types: Option<Vec<String>>,
    pub after_sequence: Option<u64>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: usize,
    pub offset: usize,
}

/// One page of query results.
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<LedgerEvent>,
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLedgerConfig {
    /// Oldest events are evicted (logically dropped) above this count.
    pub max_events: usize,
    /// When false, expected-version checks are skipped.
    pub concurrency_check: bool,
}

impl Default for EventLedgerConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            concurrency_check: true,
        }
    }
}

struct LedgerState {
    events: VecDeque<LedgerEvent>,
    versions: HashMap<String, u64>,
    sequence: u64,
    evicted: u64,
}

pub struct EventLedger {
    state: RwLock<LedgerState>,
    config: EventLedgerConfig,
    clock: SharedClock,
}

impl EventLedger {
    pub fn new(config: EventLedgerConfig, clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(LedgerState {
                events: VecDeque::new(),
                versions: HashMap::new(),
                sequence: 0,
                evicted: 0,
            }),
            config,
            clock,
        }
    }

    /// Append a single event. Fails with `ConcurrencyConflict` when
    /// concurrency checking is on and `expected_version` does not match the
    /// aggregate's current version.
    pub fn append(
        &self,
        event_type: &str,
        aggregate_id: &str,
        payload: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<String> {
        let mut state = self.state.write();
        Self::validate(event_type, aggregate_id)?;

        let current = state.versions.get(aggregate_id).copied().unwrap_or(0);
        if self.config.concurrency_check {
            if let Some(expected) = expected_version {
                if expected != current {
                    return Err(GateError::ConcurrencyConflict(format!(
                        "aggregate {}: expected version {}, current {}",
                        aggregate_id, expected, current
                    )));
                }
            }
        }

        let id = self.push_event(&mut state, event_type, aggregate_id, payload);
        self.evict_over_capacity(&mut state);
        Ok(id)
    }

    /// Append a batch atomically: either every event is assigned or none.
    /// Expected versions are checked against the versions the batch itself
    /// produces, in order.
    pub fn append_batch(&self, events: Vec<NewEvent>) -> Result<Vec<String>> {
        let mut state = self.state.write();

        // Validate the whole batch before any assignment.
        let mut projected: HashMap<String, u64> = HashMap::new();
        for ev in &events {
            Self::validate(&ev.event_type, &ev.aggregate_id)?;
            let current = projected
                .get(&ev.aggregate_id)
                .copied()
                .unwrap_or_else(|| state.versions.get(&ev.aggregate_id).copied().unwrap_or(0));
            if self.config.concurrency_check {
                if let Some(expected) = ev.expected_version {
                    if expected != current {
                        return Err(GateError::ConcurrencyConflict(format!(
                            "aggregate {}: expected version {}, current {}",
                            ev.aggregate_id, expected, current
                        )));
                    }
                }
            }
            projected.insert(ev.aggregate_id.clone(), current + 1);
        }

        let ids = events
            .into_iter()
            .map(|ev| self.push_event(&mut state, &ev.event_type, &ev.aggregate_id, ev.payload))
            .collect();
        self.evict_over_capacity(&mut state);
        Ok(ids)
    }

    /// Run a query and return one page plus the total match count.
    pub fn query(&self, q: &EventQuery) -> EventPage {
        let state = self.state.read();
        let matches: Vec<&LedgerEvent> = state
            .events
            .iter()
            .filter(|e| Self::matches(e, q))
            .collect();

        let total = matches.len();
        let limit = if q.limit == 0 { total } else { q.limit };
        let events: Vec<LedgerEvent> = matches
            .into_iter()
            .skip(q.offset)
            .take(limit)
            .cloned()
            .collect();
        let has_more = q.offset + events.len() < total;

        EventPage {
            events,
            total,
            has_more,
        }
    }

    /// Fold an aggregate's events, in version order, through a reducer.
    pub fn replay<T, F>(&self, aggregate_id: &str, reducer: F, initial: T) -> T
    where
        F: Fn(T, &LedgerEvent) -> T,
    {
        let state = self.state.read();
        state
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .fold(initial, |acc, e| reducer(acc, e))
    }

    /// Fold every retained event, in sequence order, through a reducer.
    pub fn replay_all<T, F>(&self, reducer: F, initial: T) -> T
    where
        F: Fn(T, &LedgerEvent) -> T,
    {
        let state = self.state.read();
        state.events.iter().fold(initial, |acc, e| reducer(acc, e))
    }

    /// Events for an aggregate whose timestamp is at or before the given one.
    pub fn events_as_of(&self, aggregate_id: &str, timestamp: u64) -> Vec<LedgerEvent> {
        let state = self.state.read();
        state
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id && e.timestamp <= timestamp)
            .cloned()
            .collect()
    }

    /// Current version of an aggregate (0 if it has no events).
    pub fn current_version(&self, aggregate_id: &str) -> u64 {
        self.state.read().versions.get(aggregate_id).copied().unwrap_or(0)
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().events.is_empty()
    }

    /// Number of events logically dropped by capacity eviction.
    pub fn evicted(&self) -> u64 {
        self.state.read().evicted
    }

    fn matches(e: &LedgerEvent, q: &EventQuery) -> bool {
        if let Some(aggregate_id) = &q.aggregate_id {
            if &e.aggregate_id != aggregate_id {
                return false;
            }
        }
        if let Some(event_type) = &q.event_type {
            if &e.event_type != event_type {
                return false;
            }
        }
        if let Some(types) = &q.event_types {
            if !types.iter().any(|t| t == &e.event_type) {
                return false;
            }
        }
        if let Some(after) = q.after_sequence {
            if e.sequence <= after {
                return false;
            }
        }
        if let Some(since) = q.since {
            if e.timestamp < since {
                return false;
            }
        }
        if let Some(until) = q.until {
            if e.timestamp > until {
                return false;
            }
        }
        true
    }

    fn validate(event_type: &str, aggregate_id: &str) -> Result<()> {
        if event_type.is_empty() {
            return Err(GateError::Validation("event type is required".to_string()));
        }
        if aggregate_id.is_empty() {
            return Err(GateError::Validation("aggregate id is required".to_string()));
        }
        Ok(())
    }

    fn push_event(
        &self,
        state: &mut LedgerState,
        event_type: &str,
        aggregate_id: &str,
        payload: serde_json::Value,
    ) -> String {
        state.sequence += 1;
        let version = state.versions.entry(aggregate_id.to_string()).or_insert(0);
        *version += 1;

        let event = LedgerEvent {
            id: Uuid::new_v4().to_string(),
            sequence: state.sequence,
            aggregate_id: aggregate_id.to_string(),
            event_type: event_type.to_string(),
            version: *version,
            payload,
            timestamp: self.clock.now_ms(),
        };
        let id = event.id.clone();
        state.events.push_back(event);
        id
    }

    // Eviction is a logical drop; sequence and version counters are kept.
    fn evict_over_capacity(&self, state: &mut LedgerState) {
        while state.events.len() > self.config.max_events {
            state.events.pop_front();
            state.evicted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn ledger(max_events: usize) -> (EventLedger, Arc<ManualClock>) {
        let clock = ManualClock::shared(1_000);
        let config = EventLedgerConfig {
            max_events,
            concurrency_check: true,
        };
        (EventLedger::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_append_assigns_monotonic_counters() {
        let (ledger, _) = ledger(100);
        ledger.append("key.created", "k1", json!({}), None).unwrap();
        ledger.append("key.used", "k1", json!({}), None).unwrap();
        ledger.append("key.created", "k2", json!({}), None).unwrap();

        let page = ledger.query(&EventQuery::default());
        assert_eq!(page.total, 3);
        assert_eq!(page.events[0].sequence, 1);
        assert_eq!(page.events[2].sequence, 3);
        assert_eq!(ledger.current_version("k1"), 2);
        assert_eq!(ledger.current_version("k2"), 1);
    }

    #[test]
    fn test_append_rejects_version_mismatch() {
        let (ledger, _) = ledger(100);
        ledger.append("a", "k1", json!({}), Some(0)).unwrap();
        let err = ledger.append("b", "k1", json!({}), Some(0)).unwrap_err();
        assert!(matches!(err, GateError::ConcurrencyConflict(_)));
        // A correct expected version succeeds.
        ledger.append("b", "k1", json!({}), Some(1)).unwrap();
    }

    #[test]
    fn test_append_rejects_missing_fields() {
        let (ledger, _) = ledger(100);
        assert!(ledger.append("", "k1", json!({}), None).is_err());
        assert!(ledger.append("t", "", json!({}), None).is_err());
    }

    #[test]
    fn test_batch_is_atomic() {
        let (ledger, _) = ledger(100);
        ledger.append("a", "k1", json!({}), None).unwrap();

        // Second entry has a stale expected version, so nothing is assigned.
        let batch = vec![
            NewEvent {
                event_type: "b".into(),
                aggregate_id: "k1".into(),
                payload: json!({}),
                expected_version: Some(1),
            },
            NewEvent {
                event_type: "c".into(),
                aggregate_id: "k1".into(),
                payload: json!({}),
                expected_version: Some(1),
            },
        ];
        assert!(ledger.append_batch(batch).is_err());
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.current_version("k1"), 1);

        // Progressive expected versions succeed.
        let batch = vec![
            NewEvent {
                event_type: "b".into(),
                aggregate_id: "k1".into(),
                payload: json!({}),
                expected_version: Some(1),
            },
            NewEvent {
                event_type: "c".into(),
                aggregate_id: "k1".into(),
                payload: json!({}),
                expected_version: Some(2),
            },
        ];
        let ids = ledger.append_batch(batch).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ledger.current_version("k1"), 3);
    }

    #[test]
    fn test_eviction_keeps_counters() {
        let (ledger, _) = ledger(3);
        for i in 0..5 {
            ledger.append("t", "k1", json!({ "i": i }), None).unwrap();
        }
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.evicted(), 2);
        assert_eq!(ledger.current_version("k1"), 5);

        let page = ledger.query(&EventQuery::default());
        assert_eq!(page.events[0].sequence, 3); // oldest two dropped
    }

    #[test]
    fn test_query_filters_and_pages() {
        let (ledger, clock) = ledger(100);
        ledger.append("tool.allowed", "k1", json!({}), None).unwrap();
        clock.advance(10);
        ledger.append("tool.denied", "k1", json!({}), None).unwrap();
        clock.advance(10);
        ledger.append("tool.allowed", "k2", json!({}), None).unwrap();

        let page = ledger.query(&EventQuery {
            event_type: Some("tool.allowed".into()),
            ..Default::default()
        });
        assert_eq!(page.total, 2);

        let page = ledger.query(&EventQuery {
            aggregate_id: Some("k1".into()),
            limit: 1,
            ..Default::default()
        });
        assert_eq!(page.total, 2);
        assert_eq!(page.events.len(), 1);
        assert!(page.has_more);

        let page = ledger.query(&EventQuery {
            after_sequence: Some(2),
            ..Default::default()
        });
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].aggregate_id, "k2");

        let page = ledger.query(&EventQuery {
            since: Some(1_010),
            until: Some(1_010),
            ..Default::default()
        });
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].event_type, "tool.denied");
    }

    #[test]
    fn test_replay_folds_in_order() {
        let (ledger, _) = ledger(100);
        for amount in [5u64, 7, 11] {
            ledger
                .append("credit.deducted", "k1", json!({ "amount": amount }), None)
                .unwrap();
        }
        ledger.append("credit.deducted", "k2", json!({ "amount": 100 }), None).unwrap();

        let total = ledger.replay("k1", |acc, e| acc + e.payload["amount"].as_u64().unwrap_or(0), 0u64);
        assert_eq!(total, 23);

        let all = ledger.replay_all(|acc, e| acc + e.payload["amount"].as_u64().unwrap_or(0), 0u64);
        assert_eq!(all, 123);
    }

    #[test]
    fn test_events_as_of() {
        let (ledger, clock) = ledger(100);
        ledger.append("a", "k1", json!({}), None).unwrap();
        clock.advance(100);
        ledger.append("b", "k1", json!({}), None).unwrap();

        let events = ledger.events_as_of("k1", 1_050);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "a");
    }
}
