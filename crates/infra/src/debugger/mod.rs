//! Time-travel debugging over the event log.
//!
//! A session materializes a time range of the durable log once, then lets
//! the caller move a cursor over it, inspect the reconstructed
//! [`SystemState`] at any point, set breakpoints, and run what-if folds.
//! Nothing here ever writes to the store.

pub mod analysis;
pub mod session;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use scenelog_core::{CorrelationId, EventId};
use scenelog_events::{DomainEvent, EventEnvelope, EventType, SystemState};

use crate::event_store::{EventFilter, EventStore, EventStoreError};

pub use analysis::{SessionStatistics, find_pattern, statistics};
pub use session::{DebugSession, StepResult, TimePoint};

/// Default session length when no start is given.
pub const DEFAULT_SESSION_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("no active debugging session")]
    NoSession,

    #[error("breakpoint condition never met in the session range")]
    BreakpointNeverHit,

    #[error("no breakpoint ahead of the current position")]
    NoBreakpointAhead,

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("failed to serialize session: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct SessionExport<'a> {
    session_id: Uuid,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    current_position: usize,
    current_time: DateTime<Utc>,
    event_count: usize,
    breakpoints: &'a [TimePoint],
    statistics: SessionStatistics,
}

#[derive(Debug)]
pub struct TimeTravelDebugger {
    store: Arc<EventStore>,
    session: Option<DebugSession>,
}

impl TimeTravelDebugger {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self {
            store,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&DebugSession> {
        self.session.as_ref()
    }

    fn active(&mut self) -> Result<&mut DebugSession, DebugError> {
        self.session.as_mut().ok_or(DebugError::NoSession)
    }

    /// Start (or replace) the session over `[start, end]`.
    ///
    /// `end` defaults to now and `start` to a day before `end`. The slice is
    /// read from the durable log, so compacted events are included.
    #[instrument(skip(self), err)]
    pub async fn start_session(
        &mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<&DebugSession, DebugError> {
        let end = end.unwrap_or_else(Utc::now);
        let start = start.unwrap_or(end - Duration::hours(DEFAULT_SESSION_HOURS));
        let events = self
            .store
            .load_durable(&EventFilter::between(Some(start), Some(end)))
            .await?;

        let session = DebugSession::new(start, end, events);
        tracing::info!(
            session_id = %session.session_id,
            events = session.events.len(),
            "debug session started"
        );
        Ok(self.session.insert(session))
    }

    /// Drop the session and its caches. Returns whether one was active.
    pub fn end_session(&mut self) -> bool {
        self.session.take().is_some()
    }

    /// State with every session event at or before `timestamp` applied.
    pub fn goto(&mut self, timestamp: DateTime<Utc>) -> Result<SystemState, DebugError> {
        let session = self.active()?;
        let position = session.position_at(timestamp);
        session.position = position;
        Ok(session.state_at(position))
    }

    /// Apply the next `count` events (fewer at the end of the session).
    pub fn step_forward(&mut self, count: usize) -> Result<StepResult, DebugError> {
        let session = self.active()?;
        let from = session.position;
        let to = from.saturating_add(count).min(session.events.len());
        session.position = to;
        Ok(StepResult {
            events: session.events[from..to].to_vec(),
            position: to,
            state: session.state_at(to),
        })
    }

    /// Undo the last `count` applied events (fewer at the start).
    pub fn step_backward(&mut self, count: usize) -> Result<StepResult, DebugError> {
        let session = self.active()?;
        let from = session.position;
        let to = from.saturating_sub(count);
        session.position = to;
        Ok(StepResult {
            events: session.events[to..from].to_vec(),
            position: to,
            state: session.state_at(to),
        })
    }

    /// Record a breakpoint at the first session event matching `condition`.
    pub fn set_breakpoint(
        &mut self,
        condition: impl Fn(&EventEnvelope) -> bool,
    ) -> Result<TimePoint, DebugError> {
        let session = self.active()?;
        let index = session
            .events
            .iter()
            .position(condition)
            .ok_or(DebugError::BreakpointNeverHit)?;
        let point = session.time_point(index + 1);
        session.breakpoints.push(point.clone());
        Ok(point)
    }

    /// Jump to the earliest breakpoint strictly after the current position.
    pub fn continue_to_breakpoint(&mut self) -> Result<(TimePoint, SystemState), DebugError> {
        let session = self.active()?;
        let current = session.position;
        let next = session
            .breakpoints
            .iter()
            .filter(|bp| bp.position > current)
            .min_by_key(|bp| bp.position)
            .cloned()
            .ok_or(DebugError::NoBreakpointAhead)?;
        session.position = next.position;
        let state = session.state_at(next.position);
        Ok((next, state))
    }

    /// Everything `event_id` led to, including compacted events.
    pub async fn analyze_causation_chain(
        &self,
        event_id: EventId,
    ) -> Result<Vec<EventEnvelope>, DebugError> {
        Ok(self.store.trace_causation(event_id).await?)
    }

    pub async fn analyze_correlation_chain(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<EventEnvelope>, DebugError> {
        Ok(self.store.trace_correlation(correlation_id).await?)
    }

    /// Fold an altered history without touching the store.
    ///
    /// `modify` receives the session events up to `at` (inclusive), or up to
    /// the current position when `at` is `None`.
    pub fn what_if(
        &mut self,
        modify: impl FnOnce(Vec<DomainEvent>) -> Vec<DomainEvent>,
        at: Option<DateTime<Utc>>,
    ) -> Result<SystemState, DebugError> {
        let session = self.active()?;
        let upto = match at {
            Some(t) => session.position_at(t),
            None => session.position,
        };
        let real: Vec<DomainEvent> = session.events[..upto]
            .iter()
            .map(|e| e.event().clone())
            .collect();
        let altered = modify(real);
        Ok(SystemState::from_events(&altered))
    }

    pub fn find_event_pattern(
        &self,
        pattern: &[EventType],
        within: Option<Duration>,
    ) -> Result<Vec<Vec<EventEnvelope>>, DebugError> {
        let session = self.session.as_ref().ok_or(DebugError::NoSession)?;
        Ok(find_pattern(&session.events, pattern, within))
    }

    pub fn get_statistics(&self) -> Result<SessionStatistics, DebugError> {
        let session = self.session.as_ref().ok_or(DebugError::NoSession)?;
        Ok(statistics(&session.events))
    }

    /// The session as a pretty-printed JSON document.
    pub fn export_session(&self) -> Result<String, DebugError> {
        let session = self.session.as_ref().ok_or(DebugError::NoSession)?;
        let export = SessionExport {
            session_id: session.session_id,
            start_time: session.start_time,
            end_time: session.end_time,
            current_position: session.position,
            current_time: session.current_time(),
            event_count: session.events.len(),
            breakpoints: &session.breakpoints,
            statistics: statistics(&session.events),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventLog;
    use scenelog_core::AggregateId;
    use scenelog_events::{EventPayload, Settings};

    fn created(scene: &str, at: DateTime<Utc>) -> DomainEvent {
        DomainEvent::new(
            AggregateId::scene(scene),
            EventPayload::SceneCreated {
                scene_name: scene.into(),
                scene_settings: Settings::new(),
            },
        )
        .map_metadata(|m| m.at(at))
    }

    fn switched(to: &str, at: DateTime<Utc>) -> DomainEvent {
        DomainEvent::new(
            AggregateId::scene(to),
            EventPayload::SceneSwitched {
                from_scene: "Unknown".into(),
                to_scene: to.into(),
                transition_type: None,
                transition_duration: None,
            },
        )
        .map_metadata(|m| m.at(at))
    }

    /// Main created, switched to, Guest created, switched to; one minute apart.
    async fn debugger() -> (TimeTravelDebugger, DateTime<Utc>) {
        let store = Arc::new(EventStore::open(Arc::new(InMemoryEventLog::new())).await.unwrap());
        let t0 = Utc::now() - Duration::hours(1);
        let minute = Duration::minutes(1);
        store.append(created("Main", t0)).await.unwrap();
        store.append(switched("Main", t0 + minute)).await.unwrap();
        store.append(created("Guest", t0 + minute * 2)).await.unwrap();
        store.append(switched("Guest", t0 + minute * 3)).await.unwrap();

        let mut debugger = TimeTravelDebugger::new(store);
        debugger.start_session(None, None).await.unwrap();
        (debugger, t0)
    }

    #[tokio::test]
    async fn calls_without_session_fail() {
        let store = Arc::new(EventStore::open(Arc::new(InMemoryEventLog::new())).await.unwrap());
        let mut debugger = TimeTravelDebugger::new(store);
        assert!(matches!(debugger.goto(Utc::now()), Err(DebugError::NoSession)));
        assert!(matches!(debugger.step_forward(1), Err(DebugError::NoSession)));
        assert!(matches!(debugger.get_statistics(), Err(DebugError::NoSession)));
        assert!(!debugger.end_session());
    }

    #[tokio::test]
    async fn goto_is_repeatable() {
        let (mut debugger, t0) = debugger().await;
        let t1 = t0 + Duration::seconds(90);
        let t2 = t0 + Duration::minutes(10);

        let first = debugger.goto(t1).unwrap();
        let later = debugger.goto(t2).unwrap();
        let again = debugger.goto(t1).unwrap();

        assert_eq!(first, again);
        assert_eq!(first.current_scene, "Main");
        assert_eq!(later.current_scene, "Guest");
        assert_eq!(debugger.session().unwrap().position(), 2);
    }

    #[tokio::test]
    async fn steps_clamp_at_boundaries() {
        let (mut debugger, _) = debugger().await;

        let forward = debugger.step_forward(3).unwrap();
        assert_eq!(forward.events.len(), 3);
        assert_eq!(forward.position, 3);
        assert_eq!(forward.state.scenes, vec!["Main".to_string(), "Guest".to_string()]);

        let clamped = debugger.step_forward(10).unwrap();
        assert_eq!(clamped.events.len(), 1);
        assert_eq!(clamped.position, 4);

        let back = debugger.step_backward(2).unwrap();
        assert_eq!(back.position, 2);
        assert_eq!(back.events[0].event_type(), EventType::SceneCreated);
        assert_eq!(back.state.current_scene, "Main");

        let start = debugger.step_backward(10).unwrap();
        assert_eq!(start.position, 0);
        assert_eq!(start.state, SystemState::new());
    }

    #[tokio::test]
    async fn breakpoints_only_move_forward() {
        let (mut debugger, _) = debugger().await;
        let point = debugger
            .set_breakpoint(|e| e.event_type() == EventType::SceneSwitched)
            .unwrap();
        assert_eq!(point.position, 2);
        assert_eq!(point.aggregate_versions.len(), 1);

        let (hit, state) = debugger.continue_to_breakpoint().unwrap();
        assert_eq!(hit.position, 2);
        assert_eq!(state.current_scene, "Main");

        assert!(matches!(
            debugger.continue_to_breakpoint(),
            Err(DebugError::NoBreakpointAhead)
        ));
        assert!(matches!(
            debugger.set_breakpoint(|e| e.event_type() == EventType::StreamStarted),
            Err(DebugError::BreakpointNeverHit)
        ));
    }

    #[tokio::test]
    async fn what_if_leaves_the_store_alone() {
        let (mut debugger, _) = debugger().await;
        debugger.step_forward(4).unwrap();

        let state = debugger
            .what_if(
                |events| {
                    events
                        .into_iter()
                        .filter(|e| e.event_type() != EventType::SceneSwitched)
                        .collect()
                },
                None,
            )
            .unwrap();
        assert_eq!(state.current_scene, "Unknown");
        assert_eq!(state.scenes.len(), 2);
        assert_eq!(debugger.store.last_position(), 4);
    }

    #[tokio::test]
    async fn patterns_statistics_and_export() {
        let (mut debugger, _) = debugger().await;
        let matches = debugger
            .find_event_pattern(&[EventType::SceneCreated, EventType::SceneSwitched], None)
            .unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches[0][0].position() < matches[1][0].position());

        let stats = debugger.get_statistics().unwrap();
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.event_types[&EventType::SceneCreated], 2);

        debugger.set_breakpoint(|e| e.event_type() == EventType::SceneCreated).unwrap();
        let json: serde_json::Value = serde_json::from_str(&debugger.export_session().unwrap()).unwrap();
        assert_eq!(json["event_count"], 4);
        assert_eq!(json["breakpoints"].as_array().unwrap().len(), 1);

        assert!(debugger.end_session());
        assert!(debugger.session().is_none());
    }
}
