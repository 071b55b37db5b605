//! Projection runner utilities (read model builders).
//!
//! Read models are **disposable**; events are the source of truth.
//! This module provides deterministic replay and position tracking
//! without making storage assumptions.

use chrono::{DateTime, Utc};

use scenelog_core::EventId;

use crate::{EventEnvelope, Projection, ProjectionState};

/// Last envelope folded by a runner.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProjectionCursor {
    event_id: EventId,
    timestamp: DateTime<Utc>,
    position: u64,
}

impl ProjectionCursor {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

/// Runs envelopes through a projection and tracks progress.
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    state: P::State,
    version: u64,
    cursor: Option<ProjectionCursor>,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        let state = projection.initial_state();
        Self {
            projection,
            state,
            version: 0,
            cursor: None,
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn data(&self) -> &P::State {
        &self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cursor(&self) -> Option<ProjectionCursor> {
        self.cursor
    }

    /// Global position of the last envelope seen (0 if none).
    pub fn last_position(&self) -> u64 {
        self.cursor.map(|c| c.position).unwrap_or(0)
    }

    /// Apply a single envelope.
    ///
    /// Envelopes at or below the last seen position are skipped, so the same
    /// event arriving through both subscription and polling is folded once.
    /// Returns whether the state changed.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> bool {
        if envelope.position() <= self.last_position() {
            return false;
        }

        self.cursor = Some(ProjectionCursor {
            event_id: envelope.event_id(),
            timestamp: envelope.timestamp(),
            position: envelope.position(),
        });

        if !self.projection.can_handle(envelope) {
            return false;
        }

        self.projection.handle_event(&mut self.state, envelope);
        self.version += 1;
        true
    }

    /// Apply many envelopes in order; returns how many changed the state.
    pub fn run<'a>(&mut self, envelopes: impl IntoIterator<Item = &'a EventEnvelope>) -> usize {
        envelopes
            .into_iter()
            .filter(|env| self.apply(env))
            .count()
    }

    /// Drop all folded state, ready for a replay from genesis.
    pub fn reset(&mut self) {
        self.state = self.projection.initial_state();
        self.version = 0;
        self.cursor = None;
    }

    pub fn state(&self) -> ProjectionState<P::State> {
        ProjectionState {
            name: self.projection.name().to_string(),
            last_event_id: self.cursor.map(|c| c.event_id),
            last_event_timestamp: self.cursor.map(|c| c.timestamp),
            last_position: self.cursor.map(|c| c.position),
            version: self.version,
            data: self.state.clone(),
        }
    }

    /// Rebuild a projection from scratch by replaying the full event history.
    pub fn rebuild_from_scratch<'a>(
        projection: P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope>,
    ) -> Self {
        let mut runner = ProjectionRunner::new(projection);
        runner.run(envelopes);
        runner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DomainEvent, EventPayload, EventType};
    use scenelog_core::AggregateId;

    struct MuteCounter;

    impl Projection for MuteCounter {
        type State = u32;

        fn name(&self) -> &str {
            "mutes"
        }

        fn initial_state(&self) -> u32 {
            0
        }

        fn can_handle(&self, event: &EventEnvelope) -> bool {
            event.event_type() == EventType::SourceMuted
        }

        fn handle_event(&self, state: &mut u32, _event: &EventEnvelope) {
            *state += 1;
        }
    }

    fn env(position: u64, payload: EventPayload) -> EventEnvelope {
        EventEnvelope::new(position, position, DomainEvent::new(AggregateId::source("Mic"), payload))
    }

    fn log() -> Vec<EventEnvelope> {
        vec![
            env(1, EventPayload::SourceMuted { source_name: "Mic".into() }),
            env(2, EventPayload::SourceUnmuted { source_name: "Mic".into() }),
            env(3, EventPayload::SourceMuted { source_name: "Mic".into() }),
        ]
    }

    #[test]
    fn folds_only_handled_events_and_tracks_position() {
        let runner = ProjectionRunner::rebuild_from_scratch(MuteCounter, &log());
        assert_eq!(*runner.data(), 2);
        assert_eq!(runner.version(), 2);
        assert_eq!(runner.last_position(), 3);
        let state = runner.state();
        assert_eq!(state.name, "mutes");
        assert_eq!(state.last_position, Some(3));
    }

    #[test]
    fn redelivered_envelopes_are_skipped() {
        let events = log();
        let mut runner = ProjectionRunner::new(MuteCounter);
        runner.run(&events);
        assert_eq!(runner.run(&events), 0);
        assert!(!runner.apply(&events[0]));
        assert_eq!(*runner.data(), 2);
    }

    #[test]
    fn reset_then_replay_is_deterministic() {
        let events = log();
        let mut runner = ProjectionRunner::new(MuteCounter);
        runner.run(&events);
        let first = runner.state();
        runner.reset();
        assert_eq!(*runner.data(), 0);
        runner.run(&events);
        assert_eq!(runner.state(), first);
    }
}
