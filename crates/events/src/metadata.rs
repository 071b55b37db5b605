use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scenelog_core::{CausationId, CorrelationId, EventId};

use crate::event::SCHEMA_VERSION;

pub const DEFAULT_SOURCE: &str = "scene_agent";

/// Metadata attached to every event.
///
/// Immutable once built; the `with_*` methods consume and return a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
    pub user_id: Option<String>,
    pub source: String,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self {
            event_id: EventId::new(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            source: DEFAULT_SOURCE.to_string(),
        }
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    /// Override the business timestamp (replays, imports, tests).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn caused_by(mut self, cause: impl Into<CausationId>) -> Self {
        self.causation_id = Some(cause.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_defaults_for_unset_fields() {
        let corr = CorrelationId::new();
        let meta = EventMetadata::new().with_correlation(corr).with_user("ops");
        assert_eq!(meta.correlation_id, Some(corr));
        assert_eq!(meta.user_id.as_deref(), Some("ops"));
        assert_eq!(meta.causation_id, None);
        assert_eq!(meta.source, DEFAULT_SOURCE);
        assert_eq!(meta.schema_version, SCHEMA_VERSION);
    }
}
