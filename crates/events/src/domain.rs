use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use scenelog_core::{AggregateId, EventId};

use crate::event::{Event, EventType};
use crate::metadata::EventMetadata;
use crate::payload::EventPayload;

/// An immutable fact about one aggregate.
///
/// A `DomainEvent` is what collaborators construct and hand to the store;
/// once committed it is wrapped in an `EventEnvelope` carrying its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub aggregate_id: AggregateId,
    pub metadata: EventMetadata,
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn new(aggregate_id: AggregateId, payload: EventPayload) -> Self {
        Self {
            aggregate_id,
            metadata: EventMetadata::new(),
            payload,
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replace metadata through a builder closure.
    pub fn map_metadata(mut self, f: impl FnOnce(EventMetadata) -> EventMetadata) -> Self {
        self.metadata = f(self.metadata);
        self
    }

    pub fn event_id(&self) -> EventId {
        self.metadata.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.metadata.timestamp
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn data(&self) -> Value {
        self.payload.data()
    }
}

impl Event for DomainEvent {
    fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    fn version(&self) -> u32 {
        self.metadata.schema_version
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.timestamp
    }
}
