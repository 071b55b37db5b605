use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use scenelog_events::{EventEnvelope, Projection, ProjectionRunner, ProjectionState, SubscriptionHandle};

use crate::event_store::{EventFilter, EventStore, EventStoreError};
use crate::workers::{ProjectionWorker, WorkerHandle};

use super::{AutomationProjection, PerformanceProjection, SceneProjection, StreamingProjection};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("projection not found: {0}")]
    NotFound(String),

    #[error("projection `{0}` does not have the requested state type")]
    TypeMismatch(String),

    #[error("failed to serialize projection state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to load history: {0}")]
    Store(#[from] EventStoreError),
}

/// Object-safe view of a `ProjectionRunner<P>`.
trait ErasedRunner: Send + Sync {
    fn apply(&mut self, envelope: &EventEnvelope) -> bool;
    fn reset(&mut self);

    /// Reset, then fold `history` followed by anything appended since.
    fn replay(&mut self, history: &[EventEnvelope], store: &EventStore) {
        self.reset();
        for envelope in history {
            self.apply(envelope);
        }
        for envelope in store.events_after(self.last_position()) {
            self.apply(&envelope);
        }
    }

    fn last_position(&self) -> u64;
    fn json_state(&self) -> Result<ProjectionState<Value>, serde_json::Error>;
    fn as_any(&self) -> &dyn Any;
}

impl<P: Projection> ErasedRunner for ProjectionRunner<P> {
    fn apply(&mut self, envelope: &EventEnvelope) -> bool {
        ProjectionRunner::apply(self, envelope)
    }

    fn reset(&mut self) {
        ProjectionRunner::reset(self)
    }

    fn last_position(&self) -> u64 {
        ProjectionRunner::last_position(self)
    }

    fn json_state(&self) -> Result<ProjectionState<Value>, serde_json::Error> {
        let state = self.state();
        Ok(ProjectionState {
            name: state.name,
            last_event_id: state.last_event_id,
            last_event_timestamp: state.last_event_timestamp,
            last_position: state.last_position,
            version: state.version,
            data: serde_json::to_value(&state.data)?,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type Runners = BTreeMap<String, Box<dyn ErasedRunner>>;

/// State shared between the builder, its store subscription and the polling
/// worker.
pub(crate) struct Registry {
    store: Weak<EventStore>,
    runners: RwLock<Runners>,
}

impl Registry {
    fn read(&self) -> RwLockReadGuard<'_, Runners> {
        self.runners.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Runners> {
        self.runners.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold one freshly appended envelope into every runner. A runner that
    /// is behind (the envelope is not its next position) first catches up
    /// from the store, so out-of-order notification never loses events.
    fn on_append(&self, envelope: &EventEnvelope) {
        let store = self.store.upgrade();
        let mut runners = self.write();
        for runner in runners.values_mut() {
            let last = runner.last_position();
            match &store {
                Some(store) if envelope.position() > last + 1 => {
                    for missed in store.events_after(last) {
                        runner.apply(&missed);
                    }
                }
                _ => {
                    runner.apply(envelope);
                }
            }
        }
    }

    /// Apply whatever each runner has not seen yet. Returns the number of
    /// envelopes that changed some projection.
    pub(crate) fn catch_up(&self) -> usize {
        let Some(store) = self.store.upgrade() else {
            return 0;
        };
        let mut runners = self.write();
        let Some(oldest) = runners.values().map(|r| r.last_position()).min() else {
            return 0;
        };
        let pending = store.events_after(oldest);
        pending
            .iter()
            .filter(|envelope| {
                runners
                    .values_mut()
                    .fold(false, |changed, runner| runner.apply(envelope) || changed)
            })
            .count()
    }
}

/// Keeps a set of named projections in sync with the store.
///
/// Every registered projection is rebuilt from genesis (the durable log once
/// compaction has run) on registration, then
/// fed each new append through a store subscription. The optional polling
/// worker covers anything the subscription missed; both paths are idempotent
/// because runners skip positions they have already seen.
pub struct ProjectionBuilder {
    store: Arc<EventStore>,
    registry: Arc<Registry>,
    subscription: SubscriptionHandle,
}

impl core::fmt::Debug for ProjectionBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionBuilder")
            .field("projections", &self.names())
            .finish_non_exhaustive()
    }
}

impl ProjectionBuilder {
    /// A builder with the scene, streaming, automation and performance
    /// projections registered.
    pub async fn new(store: Arc<EventStore>) -> Result<Self, ProjectionError> {
        let builder = Self::empty(store);
        builder.register(SceneProjection).await?;
        builder.register(StreamingProjection).await?;
        builder.register(AutomationProjection).await?;
        builder.register(PerformanceProjection).await?;
        Ok(builder)
    }

    pub fn empty(store: Arc<EventStore>) -> Self {
        let registry = Arc::new(Registry {
            store: Arc::downgrade(&store),
            runners: RwLock::new(BTreeMap::new()),
        });
        let subscription = {
            let registry = registry.clone();
            store.subscribe(move |envelope| {
                registry.on_append(envelope);
                Ok(())
            })
        };
        Self {
            store,
            registry,
            subscription,
        }
    }

    /// Register (or replace) a projection under its name and rebuild it
    /// from the full log.
    pub async fn register<P: Projection>(&self, projection: P) -> Result<(), ProjectionError> {
        let name = projection.name().to_string();
        let events = self.store.history(&EventFilter::new()).await?;
        let mut runner: Box<dyn ErasedRunner> = Box::new(ProjectionRunner::new(projection));
        // Appends landing between the load and the lock are picked up here;
        // later ones reach the runner through the subscription.
        let mut runners = self.registry.write();
        runner.replay(&events, &self.store);
        tracing::debug!(projection = %name, events = events.len(), "projection registered");
        runners.insert(name, runner);
        Ok(())
    }

    /// Reset one projection and replay the full log into it.
    pub async fn rebuild(&self, name: &str) -> Result<(), ProjectionError> {
        if !self.registry.read().contains_key(name) {
            return Err(ProjectionError::NotFound(name.to_string()));
        }
        let events = self.store.history(&EventFilter::new()).await?;
        let mut runners = self.registry.write();
        let runner = runners
            .get_mut(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;
        runner.replay(&events, &self.store);
        tracing::info!(projection = name, events = events.len(), "projection rebuilt");
        Ok(())
    }

    pub async fn rebuild_all(&self) -> Result<(), ProjectionError> {
        let events = self.store.history(&EventFilter::new()).await?;
        let mut runners = self.registry.write();
        for runner in runners.values_mut() {
            runner.replay(&events, &self.store);
        }
        tracing::info!(projections = runners.len(), events = events.len(), "projections rebuilt");
        Ok(())
    }

    /// Current state of one projection with its data as JSON.
    pub fn get_projection_state(&self, name: &str) -> Result<ProjectionState<Value>, ProjectionError> {
        let runners = self.registry.read();
        let runner = runners
            .get(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;
        Ok(runner.json_state()?)
    }

    /// Run `f` against a projection's typed state.
    pub fn query<P, R>(&self, name: &str, f: impl FnOnce(&P::State) -> R) -> Result<R, ProjectionError>
    where
        P: Projection,
    {
        let runners = self.registry.read();
        let runner = runners
            .get(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;
        let typed = runner
            .as_any()
            .downcast_ref::<ProjectionRunner<P>>()
            .ok_or_else(|| ProjectionError::TypeMismatch(name.to_string()))?;
        Ok(f(typed.data()))
    }

    /// Typed copy of a projection's state and progress.
    pub fn get_projection<P: Projection>(
        &self,
        name: &str,
    ) -> Result<ProjectionState<P::State>, ProjectionError> {
        let runners = self.registry.read();
        let runner = runners
            .get(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;
        runner
            .as_any()
            .downcast_ref::<ProjectionRunner<P>>()
            .map(ProjectionRunner::state)
            .ok_or_else(|| ProjectionError::TypeMismatch(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.registry.read().keys().cloned().collect()
    }

    pub fn get_all_states(&self) -> Result<BTreeMap<String, ProjectionState<Value>>, ProjectionError> {
        self.registry
            .read()
            .iter()
            .map(|(name, runner)| Ok((name.clone(), runner.json_state()?)))
            .collect()
    }

    /// Apply anything the projections have not seen yet.
    pub fn catch_up(&self) -> usize {
        self.registry.catch_up()
    }

    /// Poll the store every `interval` in a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_continuous_update(&self, interval: Duration) -> WorkerHandle {
        let registry = self.registry.clone();
        ProjectionWorker::spawn("projection-poller", interval, move || {
            Ok::<usize, std::convert::Infallible>(registry.catch_up())
        })
    }

    /// Stop following the store's subscription.
    pub fn detach(&self) {
        self.subscription.unsubscribe();
    }
}
