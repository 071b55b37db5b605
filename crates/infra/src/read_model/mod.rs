//! Denormalized current-state view for queries.
//!
//! The read model is **disposable**: it subscribes to the store for new
//! events and can always be rebuilt from genesis by replaying the log.

use std::sync::{Arc, PoisonError, RwLock, Weak};

use scenelog_events::{EventEnvelope, SourceSnapshot, SubscriptionHandle, SystemState};

use crate::event_store::{EventFilter, EventStore, EventStoreError};

#[derive(Debug, Default)]
struct View {
    state: SystemState,
    last_position: u64,
}

impl View {
    fn apply(&mut self, envelope: &EventEnvelope) -> bool {
        if envelope.position() <= self.last_position {
            return false;
        }
        self.state.apply(envelope.event());
        self.last_position = envelope.position();
        true
    }
}

/// Eventually consistent view of the current scene, stream/recording flags,
/// known scenes and per-source state.
#[derive(Debug)]
pub struct ReadModel {
    store: Arc<EventStore>,
    view: Arc<RwLock<View>>,
    subscription: SubscriptionHandle,
}

impl ReadModel {
    /// Subscribe to `store`, then fold everything already in it.
    pub async fn new(store: Arc<EventStore>) -> Result<Arc<Self>, EventStoreError> {
        let view = Arc::new(RwLock::new(View::default()));
        let subscription = follow(&store, view.clone());

        let model = Arc::new(Self {
            store,
            view,
            subscription,
        });
        model.rebuild().await?;
        Ok(model)
    }

    /// Re-derive the whole view from genesis, reading the durable log when
    /// compaction has evicted part of it.
    pub async fn rebuild(&self) -> Result<(), EventStoreError> {
        let history = self.store.history(&EventFilter::new()).await?;
        let mut view = self.view.write().unwrap_or_else(PoisonError::into_inner);
        *view = View::default();
        for envelope in &history {
            view.apply(envelope);
        }
        for envelope in self.store.events_after(view.last_position) {
            view.apply(&envelope);
        }
        tracing::debug!(last_position = view.last_position, "read model rebuilt");
        Ok(())
    }

    fn with_state<T>(&self, f: impl FnOnce(&SystemState) -> T) -> T {
        let view = self.view.read().unwrap_or_else(PoisonError::into_inner);
        f(&view.state)
    }

    pub fn current_scene(&self) -> String {
        self.with_state(|s| s.current_scene.clone())
    }

    pub fn is_streaming(&self) -> bool {
        self.with_state(|s| s.is_streaming)
    }

    pub fn is_recording(&self) -> bool {
        self.with_state(|s| s.is_recording)
    }

    pub fn scenes(&self) -> Vec<String> {
        self.with_state(|s| s.scenes.clone())
    }

    pub fn source_state(&self, source_name: &str) -> Option<SourceSnapshot> {
        self.with_state(|s| s.sources.get(source_name).cloned())
    }

    pub fn last_position(&self) -> u64 {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_position
    }

    /// Stop following the store.
    pub fn detach(&self) {
        self.subscription.unsubscribe();
    }
}

/// Follow new appends. On a position gap, catch up from the store so events
/// notified out of order are never skipped.
fn follow(store: &Arc<EventStore>, view: Arc<RwLock<View>>) -> SubscriptionHandle {
    let weak: Weak<EventStore> = Arc::downgrade(store);
    store.subscribe(move |envelope| {
        let mut view = view.write().unwrap_or_else(PoisonError::into_inner);
        if envelope.position() > view.last_position + 1 {
            if let Some(store) = weak.upgrade() {
                for missed in store.events_after(view.last_position) {
                    view.apply(&missed);
                }
            }
        }
        view.apply(envelope);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventLog;
    use scenelog_core::AggregateId;
    use scenelog_events::{DomainEvent, EventPayload, Settings};

    async fn store() -> Arc<EventStore> {
        Arc::new(EventStore::open(Arc::new(InMemoryEventLog::new())).await.unwrap())
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

    fn switched(from: &str, to: &str) -> DomainEvent {
        DomainEvent::new(
            AggregateId::scene(to),
            EventPayload::SceneSwitched {
                from_scene: from.into(),
                to_scene: to.into(),
                transition_type: None,
                transition_duration: None,
            },
        )
    }

    #[tokio::test]
    async fn reflects_existing_and_new_events() {
        let store = store().await;
        store.append(created("Main")).await.unwrap();

        let model = ReadModel::new(store.clone()).await.unwrap();
        assert_eq!(model.scenes(), vec!["Main".to_string()]);
        assert_eq!(model.current_scene(), "Unknown");

        store.append(switched("Unknown", "Main")).await.unwrap();
        assert_eq!(model.current_scene(), "Main");
        assert_eq!(model.last_position(), 2);
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let store = store().await;
        let model = ReadModel::new(store.clone()).await.unwrap();
        store.append(created("Main")).await.unwrap();
        store.append(created("Main")).await.unwrap();
        model.rebuild().await.unwrap();
        model.rebuild().await.unwrap();
        assert_eq!(model.scenes(), vec!["Main".to_string()]);
        assert_eq!(model.last_position(), 2);
    }

    #[tokio::test]
    async fn rebuild_after_compaction_matches_live_view() {
        let store = store().await;
        let model = ReadModel::new(store.clone()).await.unwrap();
        store.append(created("Main")).await.unwrap();
        store.append(switched("Unknown", "Main")).await.unwrap();

        store.compact(chrono::Utc::now() + chrono::Duration::hours(1), false);
        model.rebuild().await.unwrap();
        assert_eq!(model.current_scene(), "Main");
        assert_eq!(model.scenes(), vec!["Main".to_string()]);
        assert_eq!(model.last_position(), 2);

        let fresh = ReadModel::new(store.clone()).await.unwrap();
        assert_eq!(fresh.current_scene(), "Main");
    }

    #[tokio::test]
    async fn tracks_sources_and_stream() {
        let store = store().await;
        let model = ReadModel::new(store.clone()).await.unwrap();
        store
            .append(DomainEvent::new(
                AggregateId::source("Mic"),
                EventPayload::SourceMuted { source_name: "Mic".into() },
            ))
            .await
            .unwrap();
        store
            .append(DomainEvent::new(
                AggregateId::stream(),
                EventPayload::StreamStarted {
                    stream_settings: Settings::new(),
                    service: Some("twitch".into()),
                },
            ))
            .await
            .unwrap();
        assert!(model.source_state("Mic").unwrap().muted);
        assert!(model.source_state("Cam").is_none());
        assert!(model.is_streaming());
    }
}
