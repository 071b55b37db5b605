//! Domain events, committed envelopes and the mechanics built on them
//! (subscriber fan-out, projections, the whole-system fold).

pub mod bus;
pub mod command;
pub mod domain;
pub mod envelope;
pub mod event;
pub mod metadata;
pub mod payload;
pub mod projection;
pub mod runner;
pub mod snapshot;
pub mod state;

pub use bus::{SubscriberError, SubscriberRegistry, SubscriberResult, SubscriptionHandle};
pub use command::{Command, CommandKind};
pub use domain::DomainEvent;
pub use envelope::{EventEnvelope, EventStream};
pub use event::{Event, EventType, SCHEMA_VERSION, UnknownEventType};
pub use metadata::{DEFAULT_SOURCE, EventMetadata};
pub use payload::{EventPayload, Settings};
pub use projection::{Projection, ProjectionState};
pub use runner::{ProjectionCursor, ProjectionRunner};
pub use snapshot::Snapshot;
pub use state::{RuleSnapshot, SourceSnapshot, SystemState, UNKNOWN_SCENE};
