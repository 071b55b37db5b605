//! Filter criteria for replaying the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scenelog_core::AggregateId;
use scenelog_events::{EventEnvelope, EventType};

/// Filter criteria for event replay.
///
/// Every supplied criterion must hold (AND semantics); an empty filter
/// matches the whole log. Time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub aggregate_id: Option<AggregateId>,
    /// Events at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Events at or before this time.
    pub until: Option<DateTime<Utc>>,
    /// Any of these event types.
    pub types: Option<Vec<EventType>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    pub fn between(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self {
            since,
            until,
            ..Self::default()
        }
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        let ts = envelope.timestamp();
        self.aggregate_id
            .as_ref()
            .is_none_or(|id| envelope.aggregate_id() == id)
            && self.since.is_none_or(|since| ts >= since)
            && self.until.is_none_or(|until| ts <= until)
            && self
                .types
                .as_ref()
                .is_none_or(|types| types.contains(&envelope.event_type()))
    }
}
