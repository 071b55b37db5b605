use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use scenelog_core::{AggregateId, CorrelationId, EventId, ExpectedVersion};
use scenelog_events::{
    DomainEvent, EventEnvelope, EventStream, EventType, Snapshot, SubscriberRegistry,
    SubscriberResult, SubscriptionHandle,
};

use super::query::EventFilter;
use super::r#trait::{EventLog, EventStoreError};

/// In-memory indices over the loaded part of the log.
///
/// `global` holds envelopes in ascending position order; every other index
/// stores offsets into it. Counters (`versions`, `last_position`,
/// `known_ids`) cover the whole durable log and survive compaction.
#[derive(Debug, Default)]
struct Indices {
    global: Vec<EventEnvelope>,
    by_id: HashMap<EventId, usize>,
    by_aggregate: HashMap<AggregateId, Vec<usize>>,
    by_type: HashMap<EventType, Vec<usize>>,
    by_correlation: HashMap<CorrelationId, Vec<usize>>,
    by_cause: HashMap<Uuid, Vec<usize>>,

    known_ids: HashSet<EventId>,
    versions: HashMap<AggregateId, u64>,
    last_position: u64,

    /// Aggregates that lost events to compaction; their full history is
    /// only in the durable log.
    truncated: HashSet<AggregateId>,

    /// Latest schema-compatible snapshot per aggregate.
    snapshots: HashMap<AggregateId, Snapshot>,
}

impl Indices {
    fn insert(&mut self, envelope: EventEnvelope) {
        let offset = self.global.len();
        self.index(offset, &envelope);
        self.known_ids.insert(envelope.event_id());
        self.versions
            .insert(envelope.aggregate_id().clone(), envelope.version());
        self.last_position = self.last_position.max(envelope.position());
        self.global.push(envelope);
    }

    fn index(&mut self, offset: usize, envelope: &EventEnvelope) {
        let meta = &envelope.event().metadata;
        self.by_id.insert(envelope.event_id(), offset);
        self.by_aggregate
            .entry(envelope.aggregate_id().clone())
            .or_default()
            .push(offset);
        self.by_type
            .entry(envelope.event_type())
            .or_default()
            .push(offset);
        if let Some(correlation_id) = meta.correlation_id {
            self.by_correlation
                .entry(correlation_id)
                .or_default()
                .push(offset);
        }
        if let Some(cause) = meta.causation_id {
            self.by_cause.entry(*cause.as_uuid()).or_default().push(offset);
        }
    }

    /// Re-derive every offset index from `global` (kept in position order).
    fn reindex(&mut self) {
        self.by_id.clear();
        self.by_aggregate.clear();
        self.by_type.clear();
        self.by_correlation.clear();
        self.by_cause.clear();
        let global = std::mem::take(&mut self.global);
        for (offset, envelope) in global.iter().enumerate() {
            self.index(offset, envelope);
        }
        self.global = global;
    }

    fn collect<'a>(&'a self, offsets: Option<&'a Vec<usize>>) -> impl Iterator<Item = &'a EventEnvelope> {
        offsets
            .into_iter()
            .flatten()
            .map(move |&offset| &self.global[offset])
    }

    fn correlation_chain(&self, correlation_id: CorrelationId) -> Vec<EventEnvelope> {
        self.collect(self.by_correlation.get(&correlation_id))
            .cloned()
            .collect()
    }

    fn causation_chain(&self, root: EventId) -> Vec<EventEnvelope> {
        let mut chain = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut queue: VecDeque<Uuid> = VecDeque::from([*root.as_uuid()]);

        while let Some(cause) = queue.pop_front() {
            if !seen.insert(cause) {
                continue;
            }
            for envelope in self.collect(self.by_cause.get(&cause)) {
                let child = *envelope.event_id().as_uuid();
                if !seen.contains(&child) {
                    chain.push(envelope.clone());
                    queue.push_back(child);
                }
            }
        }

        chain
    }

    /// Whether every event `filter` could match is still in memory.
    fn is_resident(&self, filter: &EventFilter) -> bool {
        match &filter.aggregate_id {
            Some(aggregate_id) => !self.truncated.contains(aggregate_id),
            None => self.truncated.is_empty(),
        }
    }

    fn version_of(&self, aggregate_id: &AggregateId) -> u64 {
        self.versions.get(aggregate_id).copied().unwrap_or(0)
    }

    fn remember_snapshot(&mut self, snapshot: Snapshot) {
        if !snapshot.is_compatible() {
            return;
        }
        let newer = self
            .snapshots
            .get(&snapshot.aggregate_id)
            .is_none_or(|existing| snapshot.version >= existing.version);
        if newer {
            self.snapshots.insert(snapshot.aggregate_id.clone(), snapshot);
        }
    }
}

/// Summary counters for the loaded log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Events currently held in memory (after compaction).
    pub total_events: usize,
    pub aggregates: usize,
    pub event_types: BTreeMap<EventType, usize>,
    pub subscribers: usize,
    /// Highest position ever committed.
    pub last_position: u64,
    pub snapshots: usize,
}

/// Event store: durable append-only log plus in-memory indices.
///
/// An explicit handle; share it as `Arc<EventStore>`.
///
/// ## Append
///
/// Runs in two phases:
/// 1. under the write gate: assign position/version, persist durably, then
///    update the indices (a failed write leaves the indices untouched)
/// 2. after releasing the gate: notify subscribers in registration order
///
/// Reads only take the index lock briefly, so they observe either none or
/// all of an append.
pub struct EventStore {
    log: Arc<dyn EventLog>,
    write_gate: Mutex<()>,
    indices: RwLock<Indices>,
    subscribers: SubscriberRegistry,
}

impl core::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventStore")
            .field("subscribers", &self.subscribers)
            .finish_non_exhaustive()
    }
}

impl EventStore {
    /// Open a store over `log`, loading every durable event into memory.
    #[instrument(skip(log), err)]
    pub async fn open(log: Arc<dyn EventLog>) -> Result<Self, EventStoreError> {
        let envelopes = log.load_all().await?;
        let snapshots = log.load_snapshots().await?;

        let mut indices = Indices::default();
        for envelope in envelopes {
            if envelope.position() <= indices.last_position {
                return Err(EventStoreError::Corrupt(format!(
                    "position {} out of order (last {})",
                    envelope.position(),
                    indices.last_position
                )));
            }
            indices.insert(envelope);
        }
        for snapshot in snapshots {
            indices.remember_snapshot(snapshot);
        }

        tracing::info!(
            events = indices.global.len(),
            aggregates = indices.versions.len(),
            snapshots = indices.snapshots.len(),
            last_position = indices.last_position,
            "event store opened"
        );

        Ok(Self {
            log,
            write_gate: Mutex::new(()),
            indices: RwLock::new(indices),
            subscribers: SubscriberRegistry::new(),
        })
    }

    /// Release the durable backend.
    pub async fn close(&self) {
        let _gate = self.write_gate.lock().await;
        self.log.close().await;
        tracing::info!("event store closed");
    }

    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one event, returning it with its assigned position and version.
    pub async fn append(&self, event: DomainEvent) -> Result<EventEnvelope, EventStoreError> {
        self.append_expecting(event, ExpectedVersion::Any).await
    }

    /// Append with an optimistic concurrency check on the event's aggregate.
    #[instrument(
        skip(self, event),
        fields(
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type(),
            expected_version = ?expected
        ),
        err
    )]
    pub async fn append_expecting(
        &self,
        event: DomainEvent,
        expected: ExpectedVersion,
    ) -> Result<EventEnvelope, EventStoreError> {
        let envelope = {
            let _gate = self.write_gate.lock().await;

            let (position, version) = {
                let indices = self.read();
                if indices.known_ids.contains(&event.event_id()) {
                    return Err(EventStoreError::DuplicateEvent(event.event_id()));
                }
                let current = indices.version_of(&event.aggregate_id);
                if !expected.matches(current) {
                    return Err(EventStoreError::Concurrency(format!(
                        "{}: expected {expected:?}, found {current}",
                        event.aggregate_id
                    )));
                }
                (indices.last_position + 1, current + 1)
            };

            let envelope = EventEnvelope::new(position, version, event);
            self.log.append(&envelope).await?;
            self.write().insert(envelope.clone());
            envelope
        };

        tracing::debug!(
            position = envelope.position(),
            version = envelope.version(),
            "event appended"
        );

        self.subscribers.notify(&envelope);
        Ok(envelope)
    }

    /// Events of one aggregate in version order, bounds inclusive.
    pub fn get_events(
        &self,
        aggregate_id: &AggregateId,
        from_version: Option<u64>,
        to_version: Option<u64>,
    ) -> Vec<EventEnvelope> {
        let indices = self.read();
        indices
            .collect(indices.by_aggregate.get(aggregate_id))
            .filter(|e| from_version.is_none_or(|v| e.version() >= v))
            .filter(|e| to_version.is_none_or(|v| e.version() <= v))
            .cloned()
            .collect()
    }

    pub fn get_event_stream(&self, aggregate_id: &AggregateId) -> EventStream {
        let events = self.get_events(aggregate_id, None, None);
        let mut stream = EventStream::new(aggregate_id.clone(), events);
        stream.version = self.get_aggregate_version(aggregate_id);
        stream
    }

    /// Number of events ever committed for the aggregate (0 if none).
    pub fn get_aggregate_version(&self, aggregate_id: &AggregateId) -> u64 {
        self.read().version_of(aggregate_id)
    }

    /// Cross-aggregate events of one type in append order, bounds inclusive.
    pub fn get_events_by_type(
        &self,
        event_type: EventType,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<EventEnvelope> {
        let filter = EventFilter::between(since, until);
        let indices = self.read();
        indices
            .collect(indices.by_type.get(&event_type))
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// All loaded events matching `filter`, in append order.
    pub fn replay_events(&self, filter: &EventFilter) -> Vec<EventEnvelope> {
        let indices = self.read();
        match &filter.aggregate_id {
            Some(aggregate_id) => indices
                .collect(indices.by_aggregate.get(aggregate_id))
                .filter(|e| filter.matches(e))
                .cloned()
                .collect(),
            None => match &filter.types {
                Some(types) => {
                    let mut offsets: Vec<usize> = types
                        .iter()
                        .filter_map(|t| indices.by_type.get(t))
                        .flatten()
                        .copied()
                        .collect();
                    offsets.sort_unstable();
                    offsets.dedup();
                    offsets
                        .into_iter()
                        .map(|offset| &indices.global[offset])
                        .filter(|e| filter.matches(e))
                        .cloned()
                        .collect()
                }
                None => indices
                    .global
                    .iter()
                    .filter(|e| filter.matches(e))
                    .cloned()
                    .collect(),
            },
        }
    }

    pub fn all_events(&self) -> Vec<EventEnvelope> {
        self.read().global.clone()
    }

    /// Loaded events with a position strictly greater than `position`.
    pub fn events_after(&self, position: u64) -> Vec<EventEnvelope> {
        let indices = self.read();
        let start = indices.global.partition_point(|e| e.position() <= position);
        indices.global[start..].to_vec()
    }

    pub fn get_event(&self, event_id: EventId) -> Option<EventEnvelope> {
        let indices = self.read();
        indices
            .by_id
            .get(&event_id)
            .map(|&offset| indices.global[offset].clone())
    }

    pub fn last_position(&self) -> u64 {
        self.read().last_position
    }

    /// Loaded events sharing `correlation_id`, in append order.
    pub fn get_correlation_chain(&self, correlation_id: CorrelationId) -> Vec<EventEnvelope> {
        self.read().correlation_chain(correlation_id)
    }

    /// Loaded events transitively caused by `event_id` (breadth-first, each
    /// once). The root event itself is not part of the chain.
    pub fn get_causation_chain(&self, event_id: EventId) -> Vec<EventEnvelope> {
        self.read().causation_chain(event_id)
    }

    /// Like [`get_correlation_chain`](Self::get_correlation_chain), but over
    /// the whole committed log even after compaction.
    pub async fn trace_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if self.read().is_resident(&EventFilter::new()) {
            return Ok(self.get_correlation_chain(correlation_id));
        }
        Ok(self.durable_indices().await?.correlation_chain(correlation_id))
    }

    /// Like [`get_causation_chain`](Self::get_causation_chain), but over the
    /// whole committed log even after compaction.
    pub async fn trace_causation(&self, event_id: EventId) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if self.read().is_resident(&EventFilter::new()) {
            return Ok(self.get_causation_chain(event_id));
        }
        Ok(self.durable_indices().await?.causation_chain(event_id))
    }

    /// Throwaway indices over the full durable log.
    async fn durable_indices(&self) -> Result<Indices, EventStoreError> {
        let mut indices = Indices::default();
        for envelope in self.log.load_all().await? {
            indices.insert(envelope);
        }
        Ok(indices)
    }

    /// Register a listener fired synchronously after every future append.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&EventEnvelope) -> SubscriberResult + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Register a listener spawned as its own task after every future append.
    pub fn subscribe_async<F, Fut>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SubscriberResult> + Send + 'static,
    {
        self.subscribers.subscribe_async(callback)
    }

    #[instrument(
        skip(self, snapshot),
        fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.version),
        err
    )]
    pub async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        self.log.save_snapshot(&snapshot).await?;
        if !snapshot.is_compatible() {
            tracing::warn!(
                schema_version = snapshot.schema_version,
                "snapshot saved under a foreign schema; it will not be used"
            );
        }
        self.write().remember_snapshot(snapshot);
        Ok(())
    }

    /// Highest-version snapshot whose schema matches the current events.
    pub fn get_latest_snapshot(&self, aggregate_id: &AggregateId) -> Option<Snapshot> {
        self.read().snapshots.get(aggregate_id).cloned()
    }

    /// Evict old events from memory (never from the durable log).
    ///
    /// Without `keep_snapshots`, every event older than `before` is evicted.
    /// With it, an aggregate is only touched when its latest compatible
    /// snapshot was taken before `before`, and then only events that are both
    /// covered by the snapshot and older than `before` go. Returns the number
    /// of evicted events.
    #[instrument(skip(self))]
    pub fn compact(&self, before: DateTime<Utc>, keep_snapshots: bool) -> usize {
        let mut indices = self.write();
        let original = indices.global.len();

        let global = std::mem::take(&mut indices.global);
        let (retained, evicted): (Vec<EventEnvelope>, Vec<EventEnvelope>) = global
            .into_iter()
            .partition(|e| {
                if e.timestamp() >= before {
                    return true;
                }
                if !keep_snapshots {
                    return false;
                }
                match indices.snapshots.get(e.aggregate_id()) {
                    Some(snapshot) if snapshot.timestamp < before => {
                        e.version() > snapshot.version
                    }
                    _ => true,
                }
            });

        for envelope in &evicted {
            indices.truncated.insert(envelope.aggregate_id().clone());
        }
        indices.global = retained;
        indices.reindex();

        let evicted = original - indices.global.len();
        tracing::info!(
            evicted,
            remaining = indices.global.len(),
            truncated_aggregates = indices.truncated.len(),
            "compacted event store"
        );
        evicted
    }

    pub fn stats(&self) -> StoreStats {
        let indices = self.read();
        StoreStats {
            total_events: indices.global.len(),
            aggregates: indices.versions.len(),
            event_types: indices
                .by_type
                .iter()
                .map(|(t, offsets)| (*t, offsets.len()))
                .collect(),
            subscribers: self.subscribers.len(),
            last_position: indices.last_position,
            snapshots: indices.snapshots.len(),
        }
    }

    /// Every committed event matching `filter`, from genesis, in append order.
    ///
    /// Served from memory unless compaction evicted part of the requested
    /// history, in which case the durable log is read. Use this instead of
    /// [`replay_events`](Self::replay_events) wherever state is folded.
    pub async fn history(&self, filter: &EventFilter) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if self.read().is_resident(filter) {
            return Ok(self.replay_events(filter));
        }
        tracing::debug!(?filter, "history partly compacted; reading durable log");
        self.load_durable(filter).await
    }

    /// Full durable log (including compacted events) matching `filter`.
    pub async fn load_durable(&self, filter: &EventFilter) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let mut events = self.log.load_all().await?;
        events.retain(|e| filter.matches(e));
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventLog;
    use chrono::{Duration, TimeZone};
    use scenelog_events::{EventMetadata, EventPayload, Settings};
    use std::sync::Mutex as StdMutex;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn created(scene: &str, at: DateTime<Utc>) -> DomainEvent {
        DomainEvent::new(
            AggregateId::scene(scene),
            EventPayload::SceneCreated {
                scene_name: scene.to_string(),
                scene_settings: Settings::new(),
            },
        )
        .with_metadata(EventMetadata::new().at(at))
    }

    fn muted(source: &str, at: DateTime<Utc>) -> DomainEvent {
        DomainEvent::new(
            AggregateId::source(source),
            EventPayload::SourceMuted {
                source_name: source.to_string(),
            },
        )
        .with_metadata(EventMetadata::new().at(at))
    }

    async fn store() -> EventStore {
        EventStore::open(Arc::new(InMemoryEventLog::new())).await.unwrap()
    }

    #[tokio::test]
    async fn append_assigns_positions_and_versions() {
        let store = store().await;
        let a = store.append(created("Main", t(0))).await.unwrap();
        let b = store.append(muted("Mic", t(1))).await.unwrap();
        let c = store.append(muted("Mic", t(2))).await.unwrap();

        assert_eq!((a.position(), a.version()), (1, 1));
        assert_eq!((b.position(), b.version()), (2, 1));
        assert_eq!((c.position(), c.version()), (3, 2));
        assert_eq!(store.get_aggregate_version(&AggregateId::source("Mic")), 2);
        assert_eq!(store.get_aggregate_version(&AggregateId::scene("Nope")), 0);
    }

    #[tokio::test]
    async fn version_bounds_are_inclusive() {
        let store = store().await;
        for i in 0..5 {
            store.append(muted("Mic", t(i))).await.unwrap();
        }
        let mic = AggregateId::source("Mic");
        let versions: Vec<u64> = store
            .get_events(&mic, Some(2), Some(4))
            .iter()
            .map(EventEnvelope::version)
            .collect();
        assert_eq!(versions, vec![2, 3, 4]);
        assert!(store.get_events(&AggregateId::source("Cam"), None, None).is_empty());
        assert_eq!(store.get_event_stream(&mic).version, 5);
    }

    #[tokio::test]
    async fn duplicate_event_is_rejected_without_side_effects() {
        let store = store().await;
        let event = created("Main", t(0));
        store.append(event.clone()).await.unwrap();
        let err = store.append(event).await.unwrap_err();
        assert!(matches!(err, EventStoreError::DuplicateEvent(_)));
        assert_eq!(store.stats().total_events, 1);
        assert_eq!(store.last_position(), 1);
    }

    #[tokio::test]
    async fn expected_version_guards_append() {
        let store = store().await;
        store
            .append_expecting(muted("Mic", t(0)), ExpectedVersion::NoStream)
            .await
            .unwrap();
        let err = store
            .append_expecting(muted("Mic", t(1)), ExpectedVersion::Exact(0))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
        store
            .append_expecting(muted("Mic", t(1)), ExpectedVersion::Exact(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn type_and_filter_queries_respect_bounds() {
        let store = store().await;
        store.append(created("A", t(0))).await.unwrap();
        store.append(muted("Mic", t(1))).await.unwrap();
        store.append(created("B", t(2))).await.unwrap();
        store.append(created("C", t(3))).await.unwrap();

        let by_type = store.get_events_by_type(EventType::SceneCreated, Some(t(2)), Some(t(3)));
        assert_eq!(by_type.len(), 2);

        let filter = EventFilter::new()
            .types([EventType::SceneCreated])
            .until(t(2));
        let positions: Vec<u64> = store
            .replay_events(&filter)
            .iter()
            .map(EventEnvelope::position)
            .collect();
        assert_eq!(positions, vec![1, 3]);
        assert_eq!(store.events_after(2).len(), 2);
    }

    #[tokio::test]
    async fn causation_chain_is_transitive_and_excludes_unrelated() {
        let store = store().await;
        let root = store.append(created("Main", t(0))).await.unwrap();
        let child = store
            .append(muted("Mic", t(1)).map_metadata(|m| m.caused_by(root.event_id())))
            .await
            .unwrap();
        let grandchild = store
            .append(muted("Cam", t(2)).map_metadata(|m| m.caused_by(child.event_id())))
            .await
            .unwrap();
        store.append(muted("Other", t(3))).await.unwrap();

        let chain: Vec<EventId> = store
            .get_causation_chain(root.event_id())
            .iter()
            .map(EventEnvelope::event_id)
            .collect();
        assert_eq!(chain, vec![child.event_id(), grandchild.event_id()]);
    }

    #[tokio::test]
    async fn traced_chains_include_compacted_events() {
        let store = store().await;
        let corr = CorrelationId::new();
        let root = store
            .append(created("Main", t(0)).map_metadata(|m| m.with_correlation(corr)))
            .await
            .unwrap();
        let child = store
            .append(
                muted("Mic", t(5)).map_metadata(|m| m.caused_by(root.event_id()).with_correlation(corr)),
            )
            .await
            .unwrap();
        store.compact(t(1), false);

        assert_eq!(store.get_correlation_chain(corr), vec![child.clone()]);
        assert_eq!(store.trace_correlation(corr).await.unwrap(), vec![root.clone(), child.clone()]);
        assert_eq!(store.trace_causation(root.event_id()).await.unwrap(), vec![child]);
    }

    #[tokio::test]
    async fn correlation_chain_spans_aggregates() {
        let store = store().await;
        let corr = CorrelationId::new();
        store
            .append(created("Main", t(0)).map_metadata(|m| m.with_correlation(corr)))
            .await
            .unwrap();
        store.append(muted("Mic", t(1))).await.unwrap();
        store
            .append(muted("Cam", t(2)).map_metadata(|m| m.with_correlation(corr)))
            .await
            .unwrap();

        let chain = store.get_correlation_chain(corr);
        assert_eq!(chain.len(), 2);
        assert!(chain.iter().all(|e| e.event().metadata.correlation_id == Some(corr)));
    }

    #[tokio::test]
    async fn compaction_keeps_events_after_snapshot() {
        let store = store().await;
        for i in 0..4 {
            store.append(muted("Mic", t(i))).await.unwrap();
        }
        store.append(muted("Cam", t(0))).await.unwrap();
        store
            .save_snapshot(
                Snapshot::new(AggregateId::source("Mic"), 2, serde_json::json!({})).at(t(2)),
            )
            .await
            .unwrap();

        // Mic v3 is older than the cutoff but newer than the snapshot.
        let evicted = store.compact(t(10), true);
        assert_eq!(evicted, 2);
        let mic: Vec<u64> = store
            .get_events(&AggregateId::source("Mic"), None, None)
            .iter()
            .map(EventEnvelope::version)
            .collect();
        assert_eq!(mic, vec![3, 4]);
        assert_eq!(store.get_events(&AggregateId::source("Cam"), None, None).len(), 1);

        // Counters survive and appends continue from the durable position.
        assert_eq!(store.get_aggregate_version(&AggregateId::source("Mic")), 4);
        let next = store.append(muted("Mic", t(11))).await.unwrap();
        assert_eq!((next.position(), next.version()), (6, 5));

        let positions: Vec<u64> = store.all_events().iter().map(EventEnvelope::position).collect();
        assert_eq!(positions, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn compaction_without_snapshots_uses_cutoff_only() {
        let store = store().await;
        for i in 0..4 {
            store.append(muted("Mic", t(i))).await.unwrap();
        }
        assert_eq!(store.compact(t(2), false), 2);
        assert_eq!(store.stats().total_events, 2);
        assert_eq!(
            store.load_durable(&EventFilter::new()).await.unwrap().len(),
            4
        );
    }

    #[tokio::test]
    async fn history_reads_durable_log_for_compacted_aggregates() {
        let store = store().await;
        for i in 0..3 {
            store.append(muted("Mic", t(i))).await.unwrap();
        }
        store.append(muted("Cam", t(5))).await.unwrap();
        assert_eq!(store.compact(t(2), false), 2);

        let mic = EventFilter::new().aggregate(AggregateId::source("Mic"));
        assert_eq!(store.replay_events(&mic).len(), 1);
        let versions: Vec<u64> = store
            .history(&mic)
            .await
            .unwrap()
            .iter()
            .map(EventEnvelope::version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let cam = EventFilter::new().aggregate(AggregateId::source("Cam"));
        assert_eq!(store.history(&cam).await.unwrap().len(), 1);
        assert_eq!(store.history(&EventFilter::new()).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn event_lookup_by_id_follows_compaction() {
        let store = store().await;
        let old = store.append(muted("Mic", t(0))).await.unwrap();
        let recent = store.append(muted("Mic", t(5))).await.unwrap();
        assert_eq!(store.get_event(old.event_id()), Some(old.clone()));

        store.compact(t(1), false);
        assert!(store.get_event(old.event_id()).is_none());
        assert_eq!(store.get_event(recent.event_id()), Some(recent));
    }

    #[tokio::test]
    async fn foreign_schema_snapshots_are_ignored() {
        let store = store().await;
        let agg = AggregateId::stream();
        let mut foreign = Snapshot::new(agg.clone(), 9, serde_json::json!({}));
        foreign.schema_version += 1;
        store.save_snapshot(foreign).await.unwrap();
        assert!(store.get_latest_snapshot(&agg).is_none());

        store
            .save_snapshot(Snapshot::new(agg.clone(), 3, serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(store.get_latest_snapshot(&agg).unwrap().version, 3);
    }

    #[tokio::test]
    async fn subscribers_see_every_append_until_unsubscribed() {
        let store = store().await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = store.subscribe(move |e| {
            sink.lock().unwrap().push(e.position());
            Ok(())
        });
        store.append(muted("Mic", t(0))).await.unwrap();
        store.append(muted("Mic", t(1))).await.unwrap();
        handle.unsubscribe();
        store.append(muted("Mic", t(2))).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(store.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn reopening_restores_counters() {
        let log = Arc::new(InMemoryEventLog::new());
        let store = EventStore::open(log.clone()).await.unwrap();
        store.append(muted("Mic", t(0))).await.unwrap();
        store.append(muted("Mic", t(1))).await.unwrap();
        drop(store);

        let reopened = EventStore::open(log).await.unwrap();
        assert_eq!(reopened.last_position(), 2);
        let next = reopened.append(muted("Mic", t(2))).await.unwrap();
        assert_eq!((next.position(), next.version()), (3, 3));
    }
}
