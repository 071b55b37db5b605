use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scenelog_core::{AggregateId, CorrelationId};
use scenelog_events::{EventEnvelope, SystemState};

/// A point in a session's timeline.
///
/// `position` counts the session events applied at this point, so position 0
/// is the empty state before the first event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub timestamp: DateTime<Utc>,
    pub position: usize,
    /// Highest version seen per aggregate up to this point.
    pub aggregate_versions: BTreeMap<AggregateId, u64>,
    /// Correlations that have at least one event up to this point.
    pub active_correlations: BTreeSet<CorrelationId>,
}

/// Events crossed by a step and the state after it.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// In session order; for a backward step these are the events undone.
    pub events: Vec<EventEnvelope>,
    pub position: usize,
    pub state: SystemState,
}

/// One time-travel session over a fixed slice of the log.
///
/// The slice is materialized once and ordered by timestamp (ties by global
/// position), so "everything at or before t" is always a prefix.
#[derive(Debug, Clone)]
pub struct DebugSession {
    pub session_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub(crate) events: Vec<EventEnvelope>,
    pub(crate) position: usize,
    pub(crate) breakpoints: Vec<TimePoint>,
    states: BTreeMap<usize, SystemState>,
    positions_by_time: HashMap<DateTime<Utc>, usize>,
}

impl DebugSession {
    pub(crate) fn new(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        mut events: Vec<EventEnvelope>,
    ) -> Self {
        events.sort_by_key(|e| (e.timestamp(), e.position()));
        let mut states = BTreeMap::new();
        states.insert(0, SystemState::new());
        Self {
            session_id: Uuid::now_v7(),
            start_time,
            end_time,
            events,
            position: 0,
            breakpoints: Vec::new(),
            states,
            positions_by_time: HashMap::new(),
        }
    }

    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn breakpoints(&self) -> &[TimePoint] {
        &self.breakpoints
    }

    /// Timestamp of the last applied event, or the session start.
    pub fn current_time(&self) -> DateTime<Utc> {
        self.position
            .checked_sub(1)
            .and_then(|i| self.events.get(i))
            .map_or(self.start_time, EventEnvelope::timestamp)
    }

    /// Number of session events with a timestamp at or before `t`.
    pub(crate) fn position_at(&mut self, t: DateTime<Utc>) -> usize {
        if let Some(position) = self.positions_by_time.get(&t) {
            return *position;
        }
        let position = self.events.partition_point(|e| e.timestamp() <= t);
        self.positions_by_time.insert(t, position);
        position
    }

    /// State after applying the first `position` events, folding forward
    /// from the nearest cached state.
    pub(crate) fn state_at(&mut self, position: usize) -> SystemState {
        let position = position.min(self.events.len());
        let (from, mut state) = self
            .states
            .range(..=position)
            .next_back()
            .map(|(p, s)| (*p, s.clone()))
            .unwrap_or_default();
        if from == position {
            return state;
        }
        state.apply_all(self.events[from..position].iter().map(EventEnvelope::event));
        self.states.insert(position, state.clone());
        state
    }

    pub(crate) fn time_point(&self, position: usize) -> TimePoint {
        let applied = &self.events[..position.min(self.events.len())];
        let mut aggregate_versions = BTreeMap::new();
        let mut active_correlations = BTreeSet::new();
        for envelope in applied {
            let version = aggregate_versions
                .entry(envelope.aggregate_id().clone())
                .or_insert(0);
            *version = (*version).max(envelope.version());
            if let Some(correlation_id) = envelope.event().metadata.correlation_id {
                active_correlations.insert(correlation_id);
            }
        }
        TimePoint {
            timestamp: applied.last().map_or(self.start_time, EventEnvelope::timestamp),
            position,
            aggregate_versions,
            active_correlations,
        }
    }
}
