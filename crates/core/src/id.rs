//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a single domain event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

/// Identifier grouping every event produced by one logical operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

/// Identifier of a command (never persisted, but referenced as a cause).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

/// Back-reference from an event to whatever directly caused it.
///
/// A cause is either another event or the command that produced the event.
/// Both share the UUID space, so the causation graph can be walked by
/// comparing raw ids.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CausationId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(EventId, "EventId");
impl_uuid_newtype!(CorrelationId, "CorrelationId");
impl_uuid_newtype!(CommandId, "CommandId");
impl_uuid_newtype!(CausationId, "CausationId");

impl From<EventId> for CausationId {
    fn from(value: EventId) -> Self {
        Self(value.0)
    }
}

impl From<CommandId> for CausationId {
    fn from(value: CommandId) -> Self {
        Self(value.0)
    }
}

impl CausationId {
    /// Whether this cause is the given event.
    pub fn is_event(&self, event_id: EventId) -> bool {
        self.0 == event_id.0
    }
}

/// Identifier of an aggregate: the entity an event applies to.
///
/// Aggregate ids follow a `kind:name` convention (`scene:Main`, `rule:intro`)
/// except for singletons (`stream`, `recording`, `system`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    pub const STREAM: &'static str = "stream";
    pub const RECORDING: &'static str = "recording";
    pub const SYSTEM: &'static str = "system";

    /// Create an aggregate id from an arbitrary non-empty string.
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::invalid_id("AggregateId: empty"));
        }
        Ok(Self(id))
    }

    pub fn scene(name: &str) -> Self {
        Self(format!("scene:{name}"))
    }

    pub fn source(name: &str) -> Self {
        Self(format!("source:{name}"))
    }

    pub fn rule(rule_id: &str) -> Self {
        Self(format!("rule:{rule_id}"))
    }

    pub fn stream() -> Self {
        Self(Self::STREAM.to_string())
    }

    pub fn recording() -> Self {
        Self(Self::RECORDING.to_string())
    }

    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `kind` prefix (`scene`, `rule`, ...) or the whole id for singletons.
    pub fn kind(&self) -> &str {
        self.0.split_once(':').map(|(kind, _)| kind).unwrap_or(&self.0)
    }
}

impl core::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AggregateId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
