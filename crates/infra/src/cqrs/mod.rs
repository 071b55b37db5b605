//! Command/query separation over the event store.
//!
//! Writes go through the [`CommandBus`]: middleware, one handler that decides
//! which events happen, then appends. Reads go through the [`QueryBus`],
//! answered from the [`ReadModel`](crate::read_model::ReadModel) or by
//! replaying the store. Query handlers never append.

pub mod command_bus;
pub mod handlers;
pub mod query_bus;

pub use command_bus::{CommandBus, CommandError, CommandHandler, CommandMiddleware, Decision};
pub use handlers::{
    RecordingCommandHandler, SceneCommandHandler, SourceCommandHandler, StreamCommandHandler,
};
pub use query_bus::{fold_aggregate, Query, QueryBus, QueryError, QueryHandler, QueryResult, StreamStatus};
