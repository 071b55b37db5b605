use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scenelog_core::EventId;

use crate::EventEnvelope;

/// A projection folds the append-only log into a queryable view.
///
/// Projections are pure: `handle_event` may only look at the state it is
/// given and the event, so replaying the same log always yields the same
/// state. That makes read models **disposable**: they can be dropped and
/// rebuilt from genesis at any time.
///
/// Idempotency under redelivery is handled by `ProjectionRunner`, which
/// tracks the last applied position and skips anything at or below it.
pub trait Projection: Send + Sync + 'static {
    type State: Clone + Serialize + Send + Sync + 'static;

    /// Unique name used for registration and lookup.
    fn name(&self) -> &str;

    fn initial_state(&self) -> Self::State;

    /// Filter for events this projection cares about.
    fn can_handle(&self, _event: &EventEnvelope) -> bool {
        true
    }

    /// Fold one event into the state.
    fn handle_event(&self, state: &mut Self::State, event: &EventEnvelope);
}

/// A projection's current view plus its progress marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionState<T> {
    pub name: String,
    pub last_event_id: Option<EventId>,
    pub last_event_timestamp: Option<DateTime<Utc>>,
    pub last_position: Option<u64>,
    /// Number of events folded since the last reset.
    pub version: u64,
    pub data: T,
}
