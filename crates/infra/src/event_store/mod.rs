//! Append-only event store.
//!
//! `EventStore` owns ordering, indexing, subscriptions, snapshots and
//! compaction; an `EventLog` backend (SQLite or in-memory) owns durability.

pub mod export;
pub mod in_memory;
pub mod query;
pub mod sqlite;
pub mod store;
pub mod r#trait;

pub use export::{ExportDocument, ExportFormat, ExportedEvent};
pub use in_memory::InMemoryEventLog;
pub use query::EventFilter;
pub use sqlite::SqliteEventLog;
pub use store::{EventStore, StoreStats};
pub use r#trait::{EventLog, EventStoreError};
