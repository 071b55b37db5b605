//! One-stop wiring of the event-sourced core.
//!
//! `EventSourcingSystem` opens the durable log and composes the store, the
//! command and query buses, the read model and (per config) the projections
//! and the debugger. Collaborators that perform real operations record them
//! through the `record_*` helpers, which follow the aggregate id convention
//! and carry the active correlation id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use scenelog_core::{AggregateId, CorrelationId};
use scenelog_events::{
    DomainEvent, EventEnvelope, EventPayload, EventType, Settings, Snapshot, SubscriberResult,
    SubscriptionHandle,
};

use crate::config::{ConfigError, EventSourcingConfig};
use crate::cqrs::{CommandBus, QueryBus, fold_aggregate};
use crate::debugger::{DebugError, TimeTravelDebugger};
use crate::event_store::{
    EventFilter, EventLog, EventStore, EventStoreError, ExportFormat, SqliteEventLog, StoreStats,
};
use crate::projections::{ProjectionBuilder, ProjectionError};
use crate::read_model::ReadModel;
use crate::workers::WorkerHandle;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Debug(#[from] DebugError),

    #[error("{0} is disabled by configuration")]
    Disabled(&'static str),

    #[error("event {0} is not an automation trigger")]
    NotATrigger(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugSessionStats {
    pub events_in_range: usize,
    pub breakpoints: usize,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatistics {
    pub store: StoreStats,
    /// Version of each projection, when projections are enabled.
    pub projections: Option<BTreeMap<String, u64>>,
    pub debug_session: Option<DebugSessionStats>,
}

pub struct EventSourcingSystem {
    config: EventSourcingConfig,
    store: Arc<EventStore>,
    commands: CommandBus,
    read_model: Arc<ReadModel>,
    queries: QueryBus,
    projections: Option<ProjectionBuilder>,
    debugger: Option<Mutex<TimeTravelDebugger>>,
    correlation: RwLock<Option<CorrelationId>>,
    worker: Mutex<Option<WorkerHandle>>,
    snapshotter: Option<SubscriptionHandle>,
}

impl core::fmt::Debug for EventSourcingSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSourcingSystem")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl EventSourcingSystem {
    /// Install logging in the configured format, open the SQLite log at
    /// `config.db_path` and wire everything on top.
    #[tracing::instrument(skip(config), fields(db_path = %config.db_path.display()), err)]
    pub async fn open(config: EventSourcingConfig) -> Result<Self, SystemError> {
        scenelog_observability::init_with(config.log_format);
        let log = SqliteEventLog::open(&config.db_path).await?;
        Self::with_log(config, Arc::new(log)).await
    }

    /// Wire the system over an already opened backend.
    pub async fn with_log(
        config: EventSourcingConfig,
        log: Arc<dyn EventLog>,
    ) -> Result<Self, SystemError> {
        let store = Arc::new(EventStore::open(log).await?);
        let commands = CommandBus::new(store.clone());
        let read_model = ReadModel::new(store.clone()).await?;
        let queries = QueryBus::new(store.clone(), read_model.clone());

        let projections = if config.enable_projections {
            Some(ProjectionBuilder::new(store.clone()).await?)
        } else {
            None
        };
        let debugger = config
            .enable_time_travel
            .then(|| Mutex::new(TimeTravelDebugger::new(store.clone())));
        let snapshotter = config
            .enable_snapshots
            .then(|| auto_snapshots(&store, config.snapshot_frequency));

        tracing::info!(
            projections = projections.is_some(),
            time_travel = debugger.is_some(),
            snapshots = snapshotter.is_some(),
            "event sourcing system ready"
        );

        Ok(Self {
            config,
            store,
            commands,
            read_model,
            queries,
            projections,
            debugger,
            correlation: RwLock::new(None),
            worker: Mutex::new(None),
            snapshotter,
        })
    }

    pub fn config(&self) -> &EventSourcingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn commands(&self) -> &CommandBus {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut CommandBus {
        &mut self.commands
    }

    pub fn queries(&self) -> &QueryBus {
        &self.queries
    }

    pub fn read_model(&self) -> &Arc<ReadModel> {
        &self.read_model
    }

    pub fn projections(&self) -> Result<&ProjectionBuilder, SystemError> {
        self.projections
            .as_ref()
            .ok_or(SystemError::Disabled("projections"))
    }

    /// Start the projection polling worker (no-op if already running or
    /// projections are disabled). Must be called within a tokio runtime.
    pub async fn start(&self) {
        let Some(projections) = &self.projections else {
            return;
        };
        let mut worker = self.worker.lock().await;
        if worker.is_none() {
            *worker = Some(projections.start_continuous_update(self.config.projection_update_interval));
            tracing::info!("projection worker started");
        }
    }

    pub async fn stop(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.shutdown().await;
            tracing::info!("projection worker stopped");
        }
    }

    /// Stop background work and release the durable backend.
    pub async fn close(&self) {
        self.stop().await;
        if let Some(handle) = &self.snapshotter {
            handle.unsubscribe();
        }
        self.store.close().await;
    }

    /// Begin a correlation context; every event recorded until
    /// `end_correlation` carries the returned id.
    pub fn start_correlation(&self) -> CorrelationId {
        let id = CorrelationId::new();
        *self.correlation.write().unwrap_or_else(PoisonError::into_inner) = Some(id);
        id
    }

    pub fn end_correlation(&self) {
        *self.correlation.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn current_correlation(&self) -> Option<CorrelationId> {
        *self.correlation.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn record(&self, event: DomainEvent) -> Result<EventEnvelope, SystemError> {
        let event = match self.current_correlation() {
            Some(id) => event.map_metadata(|m| m.with_correlation(id)),
            None => event,
        };
        Ok(self.store.append(event).await?)
    }

    pub async fn record_scene_switched(
        &self,
        from_scene: &str,
        to_scene: &str,
        transition_type: Option<String>,
        transition_duration: Option<u64>,
    ) -> Result<EventEnvelope, SystemError> {
        self.record(DomainEvent::new(
            AggregateId::scene(to_scene),
            EventPayload::SceneSwitched {
                from_scene: from_scene.to_string(),
                to_scene: to_scene.to_string(),
                transition_type,
                transition_duration,
            },
        ))
        .await
    }

    pub async fn record_stream_started(
        &self,
        stream_settings: Settings,
        service: Option<String>,
    ) -> Result<EventEnvelope, SystemError> {
        self.record(DomainEvent::new(
            AggregateId::stream(),
            EventPayload::StreamStarted {
                stream_settings,
                service,
            },
        ))
        .await
    }

    pub async fn record_stream_stopped(
        &self,
        duration_seconds: u64,
        total_frames: u64,
        dropped_frames: u64,
        bytes_sent: u64,
    ) -> Result<EventEnvelope, SystemError> {
        self.record(DomainEvent::new(
            AggregateId::stream(),
            EventPayload::StreamStopped {
                duration_seconds,
                total_frames,
                dropped_frames,
                bytes_sent,
            },
        ))
        .await
    }

    pub async fn record_recording_started(
        &self,
        output_path: Option<String>,
        format: Option<String>,
    ) -> Result<EventEnvelope, SystemError> {
        self.record(DomainEvent::new(
            AggregateId::recording(),
            EventPayload::RecordingStarted {
                output_path,
                format,
            },
        ))
        .await
    }

    pub async fn record_recording_stopped(
        &self,
        duration_seconds: u64,
        output_path: Option<String>,
        file_size_bytes: u64,
    ) -> Result<EventEnvelope, SystemError> {
        self.record(DomainEvent::new(
            AggregateId::recording(),
            EventPayload::RecordingStopped {
                duration_seconds,
                output_path,
                file_size_bytes,
            },
        ))
        .await
    }

    /// Record a rule firing. Each trigger opens its own correlation unless a
    /// correlation context is already active.
    pub async fn record_rule_triggered(
        &self,
        rule_id: &str,
        rule_name: &str,
        trigger_type: &str,
        trigger_data: Settings,
    ) -> Result<EventEnvelope, SystemError> {
        let correlation = self.current_correlation().unwrap_or_default();
        let event = DomainEvent::new(
            AggregateId::rule(rule_id),
            EventPayload::AutomationRuleTriggered {
                rule_id: rule_id.to_string(),
                rule_name: rule_name.to_string(),
                trigger_type: trigger_type.to_string(),
                trigger_data,
            },
        )
        .map_metadata(|m| m.with_correlation(correlation));
        Ok(self.store.append(event).await?)
    }

    /// Record a successful run, caused by (and correlated with) `trigger`.
    pub async fn record_rule_executed(
        &self,
        trigger: &EventEnvelope,
        actions_executed: Vec<String>,
        execution_time_ms: f64,
        result: Settings,
    ) -> Result<EventEnvelope, SystemError> {
        let (rule_id, rule_name) = triggered_rule(trigger)?;
        let payload = EventPayload::AutomationRuleExecuted {
            rule_id: rule_id.clone(),
            rule_name,
            actions_executed,
            execution_time_ms,
            result,
        };
        self.record_follow_up(trigger, &rule_id, payload).await
    }

    /// Record a failed run, caused by (and correlated with) `trigger`.
    pub async fn record_rule_failed(
        &self,
        trigger: &EventEnvelope,
        error: &str,
    ) -> Result<EventEnvelope, SystemError> {
        let (rule_id, rule_name) = triggered_rule(trigger)?;
        let payload = EventPayload::AutomationRuleFailed {
            rule_id: rule_id.clone(),
            rule_name,
            error: error.to_string(),
        };
        self.record_follow_up(trigger, &rule_id, payload).await
    }

    async fn record_follow_up(
        &self,
        trigger: &EventEnvelope,
        rule_id: &str,
        payload: EventPayload,
    ) -> Result<EventEnvelope, SystemError> {
        let cause = &trigger.event().metadata;
        let event = DomainEvent::new(AggregateId::rule(rule_id), payload).map_metadata(|m| {
            let m = m.caused_by(cause.event_id);
            match cause.correlation_id {
                Some(id) => m.with_correlation(id),
                None => m,
            }
        });
        Ok(self.store.append(event).await?)
    }

    pub async fn statistics(&self) -> SystemStatistics {
        let projections = self.projections.as_ref().and_then(|builder| {
            builder
                .get_all_states()
                .map(|states| {
                    states
                        .into_iter()
                        .map(|(name, state)| (name, state.version))
                        .collect()
                })
                .ok()
        });

        let debug_session = match &self.debugger {
            Some(debugger) => debugger.lock().await.session().map(|s| DebugSessionStats {
                events_in_range: s.events().len(),
                breakpoints: s.breakpoints().len(),
                position: s.position(),
            }),
            None => None,
        };

        SystemStatistics {
            store: self.store.stats(),
            projections,
            debug_session,
        }
    }

    /// Look up a dotted path (`"rules.intro.trigger_count"`) in a
    /// projection's JSON state. Array elements are addressed by index.
    /// Returns `None` when the path does not resolve.
    pub fn query_projection(&self, name: &str, path: &str) -> Result<Option<Value>, SystemError> {
        let state = self.projections()?.get_projection_state(name)?;
        Ok(lookup_path(&state.data, path).cloned())
    }

    /// Start a debugging session over the last `hours_back` hours and hand
    /// out the debugger.
    pub async fn start_debugging(
        &self,
        hours_back: i64,
    ) -> Result<MutexGuard<'_, TimeTravelDebugger>, SystemError> {
        let mut debugger = self.debugger().await?;
        debugger
            .start_session(Some(Utc::now() - Duration::hours(hours_back)), None)
            .await?;
        Ok(debugger)
    }

    pub async fn debugger(&self) -> Result<MutexGuard<'_, TimeTravelDebugger>, SystemError> {
        match &self.debugger {
            Some(debugger) => Ok(debugger.lock().await),
            None => Err(SystemError::Disabled("time travel")),
        }
    }

    /// A rule's own events plus everything correlated with its triggers,
    /// once each, in log order.
    pub async fn replay_automation(
        &self,
        rule_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventEnvelope>, SystemError> {
        let mut filter = EventFilter::new().aggregate(AggregateId::rule(rule_id));
        filter.since = since;
        let own = self.store.history(&filter).await?;

        let correlations: BTreeSet<_> = own
            .iter()
            .filter(|e| e.event_type() == EventType::AutomationRuleTriggered)
            .filter_map(|e| e.event().metadata.correlation_id)
            .collect();
        let mut related = own;
        for id in correlations {
            related.extend(self.store.trace_correlation(id).await?);
        }

        let mut seen = BTreeSet::new();
        related.retain(|envelope| seen.insert(envelope.position()));
        related.sort_by_key(EventEnvelope::position);
        Ok(related)
    }

    pub async fn export_events(
        &self,
        format: ExportFormat,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<String, SystemError> {
        Ok(self.store.export(format, since, until).await?)
    }
}

fn triggered_rule(trigger: &EventEnvelope) -> Result<(String, String), SystemError> {
    match &trigger.event().payload {
        EventPayload::AutomationRuleTriggered {
            rule_id, rule_name, ..
        } => Ok((rule_id.clone(), rule_name.clone())),
        _ => Err(SystemError::NotATrigger(trigger.event_id().to_string())),
    }
}

fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .try_fold(root, |node, part| match node {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Save a `SystemState` snapshot of an aggregate every `frequency` versions.
fn auto_snapshots(store: &Arc<EventStore>, frequency: u64) -> SubscriptionHandle {
    let frequency = frequency.max(1);
    let weak = Arc::downgrade(store);
    store.subscribe_async(move |envelope: EventEnvelope| {
        snapshot_if_due(weak.clone(), envelope, frequency)
    })
}

async fn snapshot_if_due(
    store: Weak<EventStore>,
    envelope: EventEnvelope,
    frequency: u64,
) -> SubscriberResult {
    if envelope.version() % frequency != 0 {
        return Ok(());
    }
    let Some(store) = store.upgrade() else {
        return Ok(());
    };
    let aggregate_id = envelope.aggregate_id().clone();
    let state = fold_aggregate(&store, &aggregate_id, None, Some(envelope.version()));
    let snapshot = Snapshot::new(aggregate_id, envelope.version(), serde_json::to_value(&state)?);
    store.save_snapshot(snapshot).await?;
    tracing::debug!(
        aggregate_id = %envelope.aggregate_id(),
        version = envelope.version(),
        "automatic snapshot saved"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventLog;
    use crate::projections::SceneProjection;

    async fn system(config: EventSourcingConfig) -> EventSourcingSystem {
        EventSourcingSystem::with_log(config, Arc::new(InMemoryEventLog::new()))
            .await
            .unwrap()
    }

    #[test]
    fn dotted_paths_resolve_objects_and_arrays() {
        let value = serde_json::json!({"a": {"b": [10, {"c": true}]}});
        assert_eq!(lookup_path(&value, "a.b.0"), Some(&serde_json::json!(10)));
        assert_eq!(lookup_path(&value, "a.b.1.c"), Some(&Value::Bool(true)));
        assert_eq!(lookup_path(&value, "a.x"), None);
        assert_eq!(lookup_path(&value, "a.b.9"), None);
    }

    #[tokio::test]
    async fn correlation_context_is_applied() {
        let system = system(EventSourcingConfig::default()).await;
        let id = system.start_correlation();
        let first = system.record_scene_switched("Unknown", "Main", None, None).await.unwrap();
        system.end_correlation();
        let second = system.record_stream_started(Settings::new(), None).await.unwrap();

        assert_eq!(first.event().metadata.correlation_id, Some(id));
        assert_eq!(second.event().metadata.correlation_id, None);
        assert_eq!(first.aggregate_id(), &AggregateId::scene("Main"));
    }

    #[tokio::test]
    async fn rule_follow_ups_are_caused_by_the_trigger() {
        let system = system(EventSourcingConfig::default()).await;
        let trigger = system
            .record_rule_triggered("intro", "Intro music", "scene", Settings::new())
            .await
            .unwrap();
        let executed = system
            .record_rule_executed(&trigger, vec!["play".into()], 12.5, Settings::new())
            .await
            .unwrap();

        let cause = executed.event().metadata.causation_id.unwrap();
        assert!(cause.is_event(trigger.event_id()));
        assert_eq!(
            executed.event().metadata.correlation_id,
            trigger.event().metadata.correlation_id
        );
        assert!(matches!(
            system.record_rule_failed(&executed, "boom").await,
            Err(SystemError::NotATrigger(_))
        ));

        let replayed = system.replay_automation("intro", None).await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(
            system.query_projection("automation", "rules.intro.trigger_count").unwrap(),
            Some(serde_json::json!(1))
        );
    }

    #[tokio::test]
    async fn disabled_features_report_it() {
        let config = EventSourcingConfig {
            enable_projections: false,
            enable_time_travel: false,
            ..EventSourcingConfig::default()
        };
        let system = system(config).await;
        assert!(matches!(
            system.query_projection("scenes", "current_scene"),
            Err(SystemError::Disabled(_))
        ));
        assert!(matches!(
            system.start_debugging(1).await,
            Err(SystemError::Disabled(_))
        ));
        system.start().await;
        system.stop().await;
    }

    #[tokio::test]
    async fn snapshots_every_n_versions() {
        let config = EventSourcingConfig {
            snapshot_frequency: 2,
            ..EventSourcingConfig::default()
        };
        let system = system(config).await;
        for _ in 0..2 {
            system.record_stream_started(Settings::new(), None).await.unwrap();
        }

        let mut snapshot = None;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            snapshot = system.store().get_latest_snapshot(&AggregateId::stream());
            if snapshot.is_some() {
                break;
            }
        }
        let snapshot = snapshot.expect("snapshot saved");
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.state["is_streaming"], true);
    }

    #[tokio::test]
    async fn statistics_cover_store_projections_and_session() {
        let system = system(EventSourcingConfig::default()).await;
        system.record_scene_switched("Unknown", "Main", None, None).await.unwrap();
        {
            let mut debugger = system.start_debugging(1).await.unwrap();
            debugger.step_forward(1).unwrap();
        }

        let stats = system.statistics().await;
        assert_eq!(stats.store.total_events, 1);
        assert_eq!(stats.projections.unwrap()[SceneProjection::NAME], 1);
        let session = stats.debug_session.unwrap();
        assert_eq!(session.events_in_range, 1);
        assert_eq!(session.position, 1);
    }
}
