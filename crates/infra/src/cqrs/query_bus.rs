//! Read-side dispatch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scenelog_core::AggregateId;
use scenelog_events::{EventEnvelope, SourceSnapshot, SystemState};

use crate::event_store::{EventFilter, EventStore, EventStoreError};
use crate::read_model::ReadModel;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("no handler registered for query `{0}`")]
    NoHandler(String),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    CurrentScene,
    StreamStatus,
    SceneList,
    SourceState {
        source_name: String,
    },
    /// Replay through `filter`, keeping the first `limit` matches.
    EventHistory {
        #[serde(default)]
        filter: EventFilter,
        #[serde(default)]
        limit: Option<usize>,
    },
    /// One aggregate's events folded up to `at` (inclusive), or all of them.
    AggregateState {
        aggregate_id: AggregateId,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Query::CurrentScene => "current_scene",
            Query::StreamStatus => "stream_status",
            Query::SceneList => "scene_list",
            Query::SourceState { .. } => "source_state",
            Query::EventHistory { .. } => "event_history",
            Query::AggregateState { .. } => "aggregate_state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub is_streaming: bool,
    pub is_recording: bool,
    pub current_scene: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum QueryResult {
    CurrentScene(String),
    StreamStatus(StreamStatus),
    SceneList(Vec<String>),
    SourceState(Option<SourceSnapshot>),
    EventHistory(Vec<EventEnvelope>),
    AggregateState(SystemState),
}

/// Answers one family of queries. Handlers only read.
pub trait QueryHandler: Send + Sync {
    fn can_handle(&self, query: &Query) -> bool;

    fn handle(&self, query: &Query) -> Result<QueryResult, QueryError>;
}

/// Current-state lookups served by the read model.
struct ReadModelQueries {
    read_model: Arc<ReadModel>,
}

impl QueryHandler for ReadModelQueries {
    fn can_handle(&self, query: &Query) -> bool {
        matches!(
            query,
            Query::CurrentScene
                | Query::StreamStatus
                | Query::SceneList
                | Query::SourceState { .. }
        )
    }

    fn handle(&self, query: &Query) -> Result<QueryResult, QueryError> {
        let rm = &self.read_model;
        Ok(match query {
            Query::CurrentScene => QueryResult::CurrentScene(rm.current_scene()),
            Query::StreamStatus => QueryResult::StreamStatus(StreamStatus {
                is_streaming: rm.is_streaming(),
                is_recording: rm.is_recording(),
                current_scene: rm.current_scene(),
            }),
            Query::SceneList => QueryResult::SceneList(rm.scenes()),
            Query::SourceState { source_name } => {
                QueryResult::SourceState(rm.source_state(source_name))
            }
            other => return Err(QueryError::NoHandler(other.name().to_string())),
        })
    }
}

/// Fold one aggregate's events into a `SystemState`.
///
/// Only events at or before `at` and at or below `to_version` count. Folding
/// starts from the latest compatible snapshot inside both bounds; an
/// unreadable snapshot falls back to a replay from genesis.
pub fn fold_aggregate(
    store: &EventStore,
    aggregate_id: &AggregateId,
    at: Option<DateTime<Utc>>,
    to_version: Option<u64>,
) -> SystemState {
    let snapshot = store
        .get_latest_snapshot(aggregate_id)
        .filter(|s| at.is_none_or(|at| s.timestamp <= at))
        .filter(|s| to_version.is_none_or(|v| s.version <= v));

    let (mut state, from_version) = match snapshot {
        Some(snapshot) => match serde_json::from_value::<SystemState>(snapshot.state) {
            Ok(state) => (state, Some(snapshot.version + 1)),
            Err(error) => {
                tracing::warn!(
                    %aggregate_id,
                    version = snapshot.version,
                    %error,
                    "unreadable snapshot; replaying from genesis"
                );
                (SystemState::new(), None)
            }
        },
        None => (SystemState::new(), None),
    };

    let events = store.get_events(aggregate_id, from_version, to_version);
    state.apply_all(
        events
            .iter()
            .filter(|e| at.is_none_or(|at| e.timestamp() <= at))
            .map(EventEnvelope::event),
    );
    state
}

/// History and point-in-time lookups served by replaying the store.
struct ReplayQueries {
    store: Arc<EventStore>,
}

impl QueryHandler for ReplayQueries {
    fn can_handle(&self, query: &Query) -> bool {
        matches!(
            query,
            Query::EventHistory { .. } | Query::AggregateState { .. }
        )
    }

    fn handle(&self, query: &Query) -> Result<QueryResult, QueryError> {
        Ok(match query {
            Query::EventHistory { filter, limit } => {
                let mut events = self.store.replay_events(filter);
                if let Some(limit) = limit {
                    events.truncate(*limit);
                }
                QueryResult::EventHistory(events)
            }
            Query::AggregateState { aggregate_id, at } => {
                QueryResult::AggregateState(fold_aggregate(&self.store, aggregate_id, *at, None))
            }
            other => return Err(QueryError::NoHandler(other.name().to_string())),
        })
    }
}

pub struct QueryBus {
    handlers: Vec<Arc<dyn QueryHandler>>,
}

impl core::fmt::Debug for QueryBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueryBus")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl QueryBus {
    pub fn new(store: Arc<EventStore>, read_model: Arc<ReadModel>) -> Self {
        Self {
            handlers: vec![
                Arc::new(ReadModelQueries { read_model }),
                Arc::new(ReplayQueries { store }),
            ],
        }
    }

    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Register a handler ahead of the existing ones.
    pub fn register_handler(&mut self, handler: impl QueryHandler + 'static) {
        self.handlers.insert(0, Arc::new(handler));
    }

    pub fn send(&self, query: Query) -> Result<QueryResult, QueryError> {
        let handler = self
            .handlers
            .iter()
            .find(|h| h.can_handle(&query))
            .ok_or_else(|| QueryError::NoHandler(query.name().to_string()))?;
        handler.handle(&query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventLog;
    use scenelog_events::{DomainEvent, EventPayload, EventType, Settings, Snapshot};

    async fn setup() -> (Arc<EventStore>, QueryBus) {
        let store = Arc::new(EventStore::open(Arc::new(InMemoryEventLog::new())).await.unwrap());
        let read_model = ReadModel::new(store.clone()).await.unwrap();
        let bus = QueryBus::new(store.clone(), read_model);
        (store, bus)
    }

    fn created(scene: &str) -> DomainEvent {
        DomainEvent::new(
            AggregateId::scene(scene),
            EventPayload::SceneCreated {
                scene_name: scene.into(),
                scene_settings: Settings::new(),
            },
        )
    }

    fn switched(to: &str) -> DomainEvent {
        DomainEvent::new(
            AggregateId::scene(to),
            EventPayload::SceneSwitched {
                from_scene: "Unknown".into(),
                to_scene: to.into(),
                transition_type: None,
                transition_duration: None,
            },
        )
    }

    #[tokio::test]
    async fn current_scene_follows_switches() {
        let (store, bus) = setup().await;
        store.append(created("Main")).await.unwrap();
        store.append(switched("Main")).await.unwrap();

        assert_eq!(
            bus.send(Query::CurrentScene).unwrap(),
            QueryResult::CurrentScene("Main".into())
        );
        assert_eq!(
            bus.send(Query::SceneList).unwrap(),
            QueryResult::SceneList(vec!["Main".into()])
        );
        let QueryResult::StreamStatus(status) = bus.send(Query::StreamStatus).unwrap() else {
            panic!("wrong result variant");
        };
        assert!(!status.is_streaming);
        assert_eq!(status.current_scene, "Main");
    }

    #[tokio::test]
    async fn event_history_keeps_first_matches() {
        let (store, bus) = setup().await;
        for name in ["A", "B", "C"] {
            store.append(created(name)).await.unwrap();
        }
        store.append(switched("B")).await.unwrap();

        let result = bus
            .send(Query::EventHistory {
                filter: EventFilter::new().types([EventType::SceneCreated]),
                limit: Some(2),
            })
            .unwrap();
        let QueryResult::EventHistory(events) = result else {
            panic!("wrong result variant");
        };
        let positions: Vec<u64> = events.iter().map(EventEnvelope::position).collect();
        assert_eq!(positions, vec![1, 2]);
    }

    #[tokio::test]
    async fn aggregate_state_starts_from_snapshot() {
        let (store, bus) = setup().await;
        let agg = AggregateId::scene("Main");
        store.append(created("Main")).await.unwrap();

        let mut seeded = SystemState::new();
        seeded.scenes.push("FromSnapshot".into());
        store
            .save_snapshot(Snapshot::new(agg.clone(), 1, serde_json::to_value(&seeded).unwrap()))
            .await
            .unwrap();
        store.append(switched("Main")).await.unwrap();

        let QueryResult::AggregateState(state) = bus
            .send(Query::AggregateState {
                aggregate_id: agg,
                at: None,
            })
            .unwrap()
        else {
            panic!("wrong result variant");
        };
        assert_eq!(state.scenes, vec!["FromSnapshot".to_string()]);
        assert_eq!(state.current_scene, "Main");
    }

    #[tokio::test]
    async fn aggregate_state_respects_time_bound() {
        let (store, bus) = setup().await;
        let agg = AggregateId::scene("Main");
        let first = store.append(created("Main")).await.unwrap();
        let at = first.timestamp();
        store
            .append(switched("Main").map_metadata(|m| m.at(at + chrono::Duration::seconds(5))))
            .await
            .unwrap();

        let QueryResult::AggregateState(state) = bus
            .send(Query::AggregateState {
                aggregate_id: agg,
                at: Some(at),
            })
            .unwrap()
        else {
            panic!("wrong result variant");
        };
        assert_eq!(state.scenes, vec!["Main".to_string()]);
        assert_eq!(state.current_scene, "Unknown");
    }

    #[test]
    fn empty_bus_has_no_handler() {
        let err = QueryBus::empty().send(Query::SceneList).unwrap_err();
        assert!(matches!(err, QueryError::NoHandler(name) if name == "scene_list"));
    }
}
