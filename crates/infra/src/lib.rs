//! Infrastructure layer: durable event log, CQRS buses, projections,
//! time-travel debugging and system wiring.

pub mod config;
pub mod cqrs;
pub mod debugger;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod system;
pub mod workers;

pub use config::{ConfigError, EventSourcingConfig};
pub use event_store::{EventFilter, EventLog, EventStore, EventStoreError, ExportFormat};
pub use system::{EventSourcingSystem, SystemError, SystemStatistics};
