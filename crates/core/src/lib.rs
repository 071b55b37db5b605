//! `scenelog-core`: identifiers, the aggregate id convention and the
//! business-rule error shared by every other crate.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::ExpectedVersion;
pub use error::DomainError;
pub use id::{AggregateId, CausationId, CommandId, CorrelationId, EventId};
