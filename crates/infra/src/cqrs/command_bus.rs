//! Command execution pipeline.
//!
//! ```text
//! Command
//!   ↓
//! 1. Middleware (in registration order; may rewrite or reject)
//!   ↓
//! 2. Route to the first handler whose `can_handle` holds
//!   ↓
//! 3. Handler decides which events happen (reads history, never writes)
//!   ↓
//! 4. Stamp correlation/causation/user and append in order
//! ```
//!
//! Business-rule failures surface as [`CommandError::Rejected`] and are kept
//! apart from persistence failures ([`CommandError::Store`]).

use std::sync::Arc;

use tracing::instrument;

use scenelog_core::{DomainError, ExpectedVersion};
use scenelog_events::{Command, DomainEvent, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError};

use super::handlers::{
    RecordingCommandHandler, SceneCommandHandler, SourceCommandHandler, StreamCommandHandler,
};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("no handler registered for command `{0}`")]
    NoHandler(String),

    #[error("command rejected: {0}")]
    Rejected(#[from] DomainError),

    #[error("command rejected by middleware: {0}")]
    Middleware(String),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Events a handler decided on, plus the version the target aggregate must
/// still be at when the first of them is appended.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub events: Vec<DomainEvent>,
    pub expected: ExpectedVersion,
}

impl Decision {
    /// No concurrency check.
    pub fn any(events: Vec<DomainEvent>) -> Self {
        Self {
            events,
            expected: ExpectedVersion::Any,
        }
    }

    pub fn expecting(events: Vec<DomainEvent>, expected: ExpectedVersion) -> Self {
        Self { events, expected }
    }

    pub fn none() -> Self {
        Self::any(Vec::new())
    }
}

/// Decides the events for one family of commands.
///
/// Handlers fold whatever history they need through
/// [`EventStore::history`], so compaction never hides state from them.
/// Business-rule refusals are returned as [`CommandError::Rejected`].
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, command: &Command) -> bool;

    async fn handle(&self, command: &Command, store: &EventStore) -> Result<Decision, CommandError>;
}

/// Runs before routing. Returning `Err` rejects the command.
pub trait CommandMiddleware: Send + Sync {
    fn process(&self, command: Command) -> Result<Command, String>;
}

impl<F> CommandMiddleware for F
where
    F: Fn(Command) -> Result<Command, String> + Send + Sync,
{
    fn process(&self, command: Command) -> Result<Command, String> {
        self(command)
    }
}

pub struct CommandBus {
    store: Arc<EventStore>,
    handlers: Vec<Arc<dyn CommandHandler>>,
    middleware: Vec<Arc<dyn CommandMiddleware>>,
}

impl core::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandBus")
            .field(
                "handlers",
                &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

impl CommandBus {
    /// A bus with the default scene, stream, recording and source handlers.
    pub fn new(store: Arc<EventStore>) -> Self {
        let mut bus = Self::empty(store);
        bus.handlers.push(Arc::new(SceneCommandHandler));
        bus.handlers.push(Arc::new(StreamCommandHandler));
        bus.handlers.push(Arc::new(RecordingCommandHandler));
        bus.handlers.push(Arc::new(SourceCommandHandler));
        bus
    }

    /// A bus with no handlers; every command fails with `NoHandler`.
    pub fn empty(store: Arc<EventStore>) -> Self {
        Self {
            store,
            handlers: Vec::new(),
            middleware: Vec::new(),
        }
    }

    /// Register a handler ahead of the existing ones, so it takes precedence
    /// for any command it claims.
    pub fn register_handler(&mut self, handler: impl CommandHandler + 'static) {
        self.handlers.insert(0, Arc::new(handler));
    }

    pub fn add_middleware(&mut self, middleware: impl CommandMiddleware + 'static) {
        self.middleware.push(Arc::new(middleware));
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Execute a command, returning the committed envelopes in append order.
    #[instrument(skip(self, command), fields(command = command.name(), command_id = %command.command_id), err)]
    pub async fn send(&self, command: Command) -> Result<Vec<EventEnvelope>, CommandError> {
        let mut command = command;
        for middleware in &self.middleware {
            command = middleware.process(command).map_err(CommandError::Middleware)?;
        }

        let handler = self
            .handlers
            .iter()
            .find(|h| h.can_handle(&command))
            .ok_or_else(|| CommandError::NoHandler(command.name().to_string()))?;

        let decision = handler
            .handle(&command, &self.store)
            .await
            .inspect_err(|err| {
                if let CommandError::Rejected(rejection) = err {
                    tracing::info!(
                        handler = handler.name(),
                        kind = rejection.kind(),
                        reason = %rejection,
                        "command rejected"
                    );
                }
            })?;

        let mut committed = Vec::with_capacity(decision.events.len());
        let mut expected = decision.expected;
        for event in decision.events {
            let event = stamp(event, &command);
            let envelope = self.store.append_expecting(event, expected).await?;
            committed.push(envelope);
            expected = ExpectedVersion::Any;
        }

        tracing::debug!(
            handler = handler.name(),
            events = committed.len(),
            "command executed"
        );
        Ok(committed)
    }
}

/// Carry the command's correlation, user and identity onto a decided event.
fn stamp(event: DomainEvent, command: &Command) -> DomainEvent {
    event.map_metadata(|meta| {
        let mut meta = meta.caused_by(command.command_id);
        if let Some(correlation_id) = command.correlation_id {
            meta = meta.with_correlation(correlation_id);
        }
        if let Some(user_id) = &command.user_id {
            meta = meta.with_user(user_id.clone());
        }
        meta
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventLog;
    use scenelog_core::{CausationId, CorrelationId};
    use scenelog_events::{CommandKind, EventPayload, EventType, Settings};

    async fn bus() -> CommandBus {
        let store = EventStore::open(Arc::new(InMemoryEventLog::new())).await.unwrap();
        CommandBus::new(Arc::new(store))
    }

    fn start_stream() -> Command {
        Command::new(CommandKind::StartStream {
            stream_settings: Settings::new(),
            service: Some("twitch".into()),
        })
    }

    #[tokio::test]
    async fn stamps_command_context_onto_events() {
        let bus = bus().await;
        let correlation = CorrelationId::new();
        let command = Command::new(CommandKind::CreateScene {
            scene_name: "Main".into(),
            scene_settings: Settings::new(),
        })
        .with_correlation(correlation)
        .with_user("operator");
        let command_id = command.command_id;

        let committed = bus.send(command).await.unwrap();
        assert_eq!(committed.len(), 1);
        let meta = &committed[0].event().metadata;
        assert_eq!(meta.correlation_id, Some(correlation));
        assert_eq!(meta.causation_id, Some(CausationId::from(command_id)));
        assert_eq!(meta.user_id.as_deref(), Some("operator"));
    }

    #[tokio::test]
    async fn starting_an_active_stream_is_a_business_error() {
        let bus = bus().await;
        bus.send(start_stream()).await.unwrap();
        let err = bus.send(start_stream()).await.unwrap_err();
        assert!(matches!(err, CommandError::Rejected(DomainError::InvariantViolation(_))));
        assert_eq!(bus.store().get_aggregate_version(&scenelog_core::AggregateId::stream()), 1);
    }

    #[tokio::test]
    async fn empty_bus_has_no_handler() {
        let store = EventStore::open(Arc::new(InMemoryEventLog::new())).await.unwrap();
        let bus = CommandBus::empty(Arc::new(store));
        let err = bus.send(start_stream()).await.unwrap_err();
        assert!(matches!(err, CommandError::NoHandler(name) if name == "start_stream"));
    }

    #[tokio::test]
    async fn middleware_can_rewrite_or_reject() {
        let mut bus = bus().await;
        bus.add_middleware(|mut command: Command| {
            if let CommandKind::CreateScene { scene_name, .. } = &mut command.kind {
                *scene_name = scene_name.trim().to_string();
            }
            Ok(command)
        });
        bus.add_middleware(|command: Command| {
            if command.user_id.as_deref() == Some("guest") {
                Err("guests may not issue commands".to_string())
            } else {
                Ok(command)
            }
        });

        let committed = bus
            .send(Command::new(CommandKind::CreateScene {
                scene_name: "  Main ".into(),
                scene_settings: Settings::new(),
            }))
            .await
            .unwrap();
        assert!(matches!(
            &committed[0].event().payload,
            EventPayload::SceneCreated { scene_name, .. } if scene_name == "Main"
        ));

        let err = bus.send(start_stream().with_user("guest")).await.unwrap_err();
        assert!(matches!(err, CommandError::Middleware(_)));
        assert!(bus.store().get_events_by_type(EventType::StreamStarted, None, None).is_empty());
    }

    struct Silent;

    #[async_trait::async_trait]
    impl CommandHandler for Silent {
        fn name(&self) -> &'static str {
            "silent"
        }

        fn can_handle(&self, command: &Command) -> bool {
            matches!(command.kind, CommandKind::StartStream { .. })
        }

        async fn handle(&self, _: &Command, _: &EventStore) -> Result<Decision, CommandError> {
            Ok(Decision::none())
        }
    }

    #[tokio::test]
    async fn registered_handler_takes_precedence() {
        let mut bus = bus().await;
        bus.register_handler(Silent);
        assert!(bus.send(start_stream()).await.unwrap().is_empty());
    }
}
