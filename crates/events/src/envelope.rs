use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scenelog_core::{AggregateId, EventId};

use crate::domain::DomainEvent;
use crate::event::EventType;

/// A committed event: the unit the store hands back and fans out.
///
/// Notes:
/// - `position` is the 1-based global append position, unique across the log.
/// - `version` is the 1-based sequence number within the event's aggregate.
/// - both are assigned by the store at append time and never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    position: u64,
    version: u64,
    event: DomainEvent,
}

impl EventEnvelope {
    pub fn new(position: u64, version: u64, event: DomainEvent) -> Self {
        Self {
            position,
            version,
            event,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn event(&self) -> &DomainEvent {
        &self.event
    }

    pub fn into_event(self) -> DomainEvent {
        self.event
    }

    pub fn event_id(&self) -> EventId {
        self.event.metadata.event_id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.event.aggregate_id
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.event.metadata.timestamp
    }
}

/// Ordered committed events for a single aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStream {
    pub aggregate_id: AggregateId,
    pub events: Vec<EventEnvelope>,
    /// Number of events committed for the aggregate.
    pub version: u64,
}

impl EventStream {
    pub fn new(aggregate_id: AggregateId, events: Vec<EventEnvelope>) -> Self {
        let version = events.last().map(EventEnvelope::version).unwrap_or(0);
        Self {
            aggregate_id,
            events,
            version,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events with a version strictly greater than `version`.
    pub fn events_since(&self, version: u64) -> impl Iterator<Item = &EventEnvelope> {
        self.events.iter().filter(move |e| e.version() > version)
    }

    /// Events strictly before `timestamp`.
    pub fn events_before(&self, timestamp: DateTime<Utc>) -> impl Iterator<Item = &EventEnvelope> {
        self.events.iter().filter(move |e| e.timestamp() < timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::EventMetadata;
    use crate::payload::EventPayload;
    use chrono::{Duration, TimeZone};

    fn muted(version: u64, at: DateTime<Utc>) -> EventEnvelope {
        let event = DomainEvent::new(
            AggregateId::source("Mic"),
            EventPayload::SourceMuted {
                source_name: "Mic".into(),
            },
        )
        .with_metadata(EventMetadata::new().at(at));
        EventEnvelope::new(version, version, event)
    }

    #[test]
    fn stream_helpers_filter_by_version_and_time() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let stream = EventStream::new(
            AggregateId::source("Mic"),
            (1..=4).map(|v| muted(v, t0 + Duration::minutes(v as i64))).collect(),
        );
        assert_eq!(stream.version, 4);
        assert_eq!(stream.events_since(2).map(|e| e.version()).collect::<Vec<_>>(), vec![3, 4]);
        let cutoff = t0 + Duration::minutes(3);
        assert_eq!(stream.events_before(cutoff).count(), 2);
    }

    #[test]
    fn empty_stream_is_at_version_zero() {
        let stream = EventStream::new(AggregateId::stream(), Vec::new());
        assert!(stream.is_empty());
        assert_eq!(stream.version, 0);
    }
}
