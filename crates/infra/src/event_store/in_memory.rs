use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use scenelog_core::{AggregateId, EventId};
use scenelog_events::{EventEnvelope, Snapshot};

use super::r#trait::{EventLog, EventStoreError};

#[derive(Debug, Default)]
struct Inner {
    events: Vec<EventEnvelope>,
    ids: HashSet<EventId>,
    snapshots: BTreeMap<(AggregateId, u64), Snapshot>,
    closed: bool,
}

/// In-memory event log.
///
/// Intended for tests/dev. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    inner: RwLock<Inner>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> EventStoreError {
    EventStoreError::Storage("lock poisoned".to_string())
}

#[async_trait::async_trait]
impl EventLog for InMemoryEventLog {
    async fn load_all(&self) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.events.clone())
    }

    async fn append(&self, envelope: &EventEnvelope) -> Result<(), EventStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if inner.closed {
            return Err(EventStoreError::Storage("log is closed".to_string()));
        }
        if !inner.ids.insert(envelope.event_id()) {
            return Err(EventStoreError::DuplicateEvent(envelope.event_id()));
        }
        inner.events.push(envelope.clone());
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), EventStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if inner.closed {
            return Err(EventStoreError::Storage("log is closed".to_string()));
        }
        inner.snapshots.insert(
            (snapshot.aggregate_id.clone(), snapshot.version),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn load_snapshots(&self) -> Result<Vec<Snapshot>, EventStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.snapshots.values().cloned().collect())
    }

    async fn close(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.closed = true;
        }
    }
}
