use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use scenelog_core::AggregateId;

use crate::event::SCHEMA_VERSION;

/// Point-in-time fold of one aggregate, used to shorten replay.
///
/// `state` is opaque to the store. A snapshot is only usable when its
/// `schema_version` matches the current event schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    pub state: Value,
}

impl Snapshot {
    /// Snapshot at `version` under the current schema.
    pub fn new(aggregate_id: AggregateId, version: u64, state: Value) -> Self {
        Self {
            aggregate_id,
            version,
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            state,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_compatible(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compatibility_follows_schema_version() {
        let snap = Snapshot::new(AggregateId::stream(), 3, json!({"is_streaming": true}));
        assert!(snap.is_compatible());
        let stale = Snapshot {
            schema_version: SCHEMA_VERSION + 1,
            ..snap
        };
        assert!(!stale.is_compatible());
    }
}
