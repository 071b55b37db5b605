use std::sync::Arc;

use thiserror::Error;

use scenelog_core::EventId;
use scenelog_events::{EventEnvelope, Snapshot};

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, serialization, concurrency)
/// as opposed to domain errors (business-rule rejections).
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The durable write or read failed; fatal to the triggering operation.
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("duplicate event id: {0}")]
    DuplicateEvent(EventId),

    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// A stored record could not be decoded back into an event.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for EventStoreError {
    fn from(err: serde_json::Error) -> Self {
        EventStoreError::Serialization(err.to_string())
    }
}

/// Durable, append-only backing log.
///
/// The log stores committed envelopes exactly as the store numbered them; it
/// never assigns positions or versions itself. All ordering and indexing is
/// the `EventStore`'s job.
///
/// Implementations must:
/// - persist an envelope atomically (all of it or nothing)
/// - reject a second envelope with the same event id
/// - return envelopes from `load_all` in ascending position order
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Every stored envelope in global position order (startup recovery).
    async fn load_all(&self) -> Result<Vec<EventEnvelope>, EventStoreError>;

    async fn append(&self, envelope: &EventEnvelope) -> Result<(), EventStoreError>;

    /// Store a snapshot; an existing snapshot at the same version is replaced.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), EventStoreError>;

    /// Every stored snapshot, ordered by aggregate then version.
    async fn load_snapshots(&self) -> Result<Vec<Snapshot>, EventStoreError>;

    /// Release backend resources. Further calls may fail with `Storage`.
    async fn close(&self);
}

#[async_trait::async_trait]
impl<L> EventLog for Arc<L>
where
    L: EventLog + ?Sized,
{
    async fn load_all(&self) -> Result<Vec<EventEnvelope>, EventStoreError> {
        (**self).load_all().await
    }

    async fn append(&self, envelope: &EventEnvelope) -> Result<(), EventStoreError> {
        (**self).append(envelope).await
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), EventStoreError> {
        (**self).save_snapshot(snapshot).await
    }

    async fn load_snapshots(&self) -> Result<Vec<Snapshot>, EventStoreError> {
        (**self).load_snapshots().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
