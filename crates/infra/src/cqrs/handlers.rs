//! Default command handlers.
//!
//! Each handler rebuilds just enough state from the full history to validate
//! the command, then decides the resulting events. None of them write.

use chrono::Utc;

use scenelog_core::{AggregateId, DomainError, ExpectedVersion};
use scenelog_events::{
    Command, CommandKind, DomainEvent, EventEnvelope, EventPayload, EventType, SystemState,
};

use crate::event_store::{EventFilter, EventStore, EventStoreError};

use super::command_bus::{CommandError, CommandHandler, Decision};

/// Fold of every scene event ever committed.
async fn scene_state(store: &EventStore) -> Result<SystemState, EventStoreError> {
    let filter = EventFilter::new().types([
        EventType::SceneCreated,
        EventType::SceneSwitched,
        EventType::SceneRemoved,
        EventType::SceneRenamed,
    ]);
    let events = store.history(&filter).await?;
    Ok(SystemState::from_events(events.iter().map(EventEnvelope::event)))
}

fn require_name(kind: &str, name: &str) -> Result<(), DomainError> {
    if name.trim().is_empty() {
        return Err(DomainError::validation(format!("{kind} name must not be empty")));
    }
    Ok(())
}

/// Create, remove, rename and switch scenes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SceneCommandHandler;

#[async_trait::async_trait]
impl CommandHandler for SceneCommandHandler {
    fn name(&self) -> &'static str {
        "scenes"
    }

    fn can_handle(&self, command: &Command) -> bool {
        matches!(
            command.kind,
            CommandKind::SwitchScene { .. }
                | CommandKind::CreateScene { .. }
                | CommandKind::RemoveScene { .. }
                | CommandKind::RenameScene { .. }
        )
    }

    async fn handle(&self, command: &Command, store: &EventStore) -> Result<Decision, CommandError> {
        let state = scene_state(store).await?;
        let known = |name: &str| state.scenes.iter().any(|s| s == name);

        let payload = match &command.kind {
            // Switching is allowed even to scenes the log never saw created.
            CommandKind::SwitchScene {
                scene_name,
                transition_type,
                transition_duration,
            } => {
                require_name("scene", scene_name)?;
                EventPayload::SceneSwitched {
                    from_scene: state.current_scene.clone(),
                    to_scene: scene_name.clone(),
                    transition_type: transition_type.clone(),
                    transition_duration: *transition_duration,
                }
            }
            CommandKind::CreateScene {
                scene_name,
                scene_settings,
            } => {
                require_name("scene", scene_name)?;
                if known(scene_name) {
                    return Err(DomainError::conflict(format!(
                        "scene `{scene_name}` already exists"
                    ))
                    .into());
                }
                EventPayload::SceneCreated {
                    scene_name: scene_name.clone(),
                    scene_settings: scene_settings.clone(),
                }
            }
            CommandKind::RemoveScene { scene_name } => {
                if !known(scene_name) {
                    return Err(DomainError::not_found(format!("scene `{scene_name}`")).into());
                }
                EventPayload::SceneRemoved {
                    scene_name: scene_name.clone(),
                }
            }
            CommandKind::RenameScene { old_name, new_name } => {
                require_name("scene", new_name)?;
                if !known(old_name) {
                    return Err(DomainError::not_found(format!("scene `{old_name}`")).into());
                }
                if known(new_name) {
                    return Err(DomainError::conflict(format!(
                        "scene `{new_name}` already exists"
                    ))
                    .into());
                }
                EventPayload::SceneRenamed {
                    old_name: old_name.clone(),
                    new_name: new_name.clone(),
                }
            }
            other => {
                return Err(DomainError::validation(format!(
                    "scene handler cannot decide `{}`",
                    other.name()
                ))
                .into());
            }
        };

        Ok(Decision::any(vec![DomainEvent::new(
            command.aggregate_id(),
            payload,
        )]))
    }
}

/// The last event of a singleton aggregate if it started a session.
async fn open_session(
    store: &EventStore,
    aggregate_id: &AggregateId,
    started: EventType,
) -> Result<(u64, Option<EventEnvelope>), EventStoreError> {
    let version = store.get_aggregate_version(aggregate_id);
    let last = store
        .history(&EventFilter::new().aggregate(aggregate_id.clone()))
        .await?
        .into_iter()
        .rfind(|e| e.version() == version)
        .filter(|e| e.event_type() == started);
    Ok((version, last))
}

fn seconds_since(start: &EventEnvelope) -> u64 {
    (Utc::now() - start.timestamp()).num_seconds().max(0) as u64
}

/// Start/stop the live stream; at most one stream runs at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamCommandHandler;

#[async_trait::async_trait]
impl CommandHandler for StreamCommandHandler {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn can_handle(&self, command: &Command) -> bool {
        matches!(
            command.kind,
            CommandKind::StartStream { .. } | CommandKind::StopStream { .. }
        )
    }

    async fn handle(&self, command: &Command, store: &EventStore) -> Result<Decision, CommandError> {
        let aggregate_id = AggregateId::stream();
        let (version, active) = open_session(store, &aggregate_id, EventType::StreamStarted).await?;

        let payload = match &command.kind {
            CommandKind::StartStream {
                stream_settings,
                service,
            } => {
                if active.is_some() {
                    return Err(DomainError::invariant("stream is already active").into());
                }
                EventPayload::StreamStarted {
                    stream_settings: stream_settings.clone(),
                    service: service.clone(),
                }
            }
            CommandKind::StopStream {
                total_frames,
                dropped_frames,
                bytes_sent,
            } => {
                let Some(started) = active else {
                    return Err(DomainError::invariant("no active stream to stop").into());
                };
                EventPayload::StreamStopped {
                    duration_seconds: seconds_since(&started),
                    total_frames: *total_frames,
                    dropped_frames: *dropped_frames,
                    bytes_sent: *bytes_sent,
                }
            }
            other => {
                return Err(DomainError::validation(format!(
                    "stream handler cannot decide `{}`",
                    other.name()
                ))
                .into());
            }
        };

        Ok(Decision::expecting(
            vec![DomainEvent::new(aggregate_id, payload)],
            ExpectedVersion::Exact(version),
        ))
    }
}

/// Start/stop recording; at most one recording runs at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordingCommandHandler;

#[async_trait::async_trait]
impl CommandHandler for RecordingCommandHandler {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn can_handle(&self, command: &Command) -> bool {
        matches!(
            command.kind,
            CommandKind::StartRecording { .. } | CommandKind::StopRecording { .. }
        )
    }

    async fn handle(&self, command: &Command, store: &EventStore) -> Result<Decision, CommandError> {
        let aggregate_id = AggregateId::recording();
        let (version, active) =
            open_session(store, &aggregate_id, EventType::RecordingStarted).await?;

        let payload = match &command.kind {
            CommandKind::StartRecording {
                output_path,
                format,
            } => {
                if active.is_some() {
                    return Err(DomainError::invariant("recording is already active").into());
                }
                EventPayload::RecordingStarted {
                    output_path: output_path.clone(),
                    format: format.clone(),
                }
            }
            CommandKind::StopRecording { file_size_bytes } => {
                let Some(started) = active else {
                    return Err(DomainError::invariant("no active recording to stop").into());
                };
                let output_path = match &started.event().payload {
                    EventPayload::RecordingStarted { output_path, .. } => output_path.clone(),
                    _ => None,
                };
                EventPayload::RecordingStopped {
                    duration_seconds: seconds_since(&started),
                    output_path,
                    file_size_bytes: *file_size_bytes,
                }
            }
            other => {
                return Err(DomainError::validation(format!(
                    "recording handler cannot decide `{}`",
                    other.name()
                ))
                .into());
            }
        };

        Ok(Decision::expecting(
            vec![DomainEvent::new(aggregate_id, payload)],
            ExpectedVersion::Exact(version),
        ))
    }
}

/// Volume and mute changes on a single source.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceCommandHandler;

#[async_trait::async_trait]
impl CommandHandler for SourceCommandHandler {
    fn name(&self) -> &'static str {
        "sources"
    }

    fn can_handle(&self, command: &Command) -> bool {
        matches!(
            command.kind,
            CommandKind::SetSourceVolume { .. }
                | CommandKind::MuteSource { .. }
                | CommandKind::UnmuteSource { .. }
        )
    }

    async fn handle(&self, command: &Command, store: &EventStore) -> Result<Decision, CommandError> {
        let aggregate_id = command.aggregate_id();
        let history = store
            .history(&EventFilter::new().aggregate(aggregate_id.clone()))
            .await?;
        let state = SystemState::from_events(history.iter().map(EventEnvelope::event));

        let payload = match &command.kind {
            CommandKind::SetSourceVolume {
                source_name,
                volume,
                volume_db,
            } => {
                require_name("source", source_name)?;
                if !volume.is_finite() || *volume < 0.0 {
                    return Err(DomainError::validation(format!(
                        "volume must be a non-negative number, got {volume}"
                    ))
                    .into());
                }
                let old_volume = state
                    .sources
                    .get(source_name)
                    .and_then(|s| s.volume)
                    .unwrap_or(1.0);
                EventPayload::SourceVolumeChanged {
                    source_name: source_name.clone(),
                    old_volume,
                    new_volume: *volume,
                    volume_db: *volume_db,
                }
            }
            CommandKind::MuteSource { source_name } => {
                require_name("source", source_name)?;
                if state.sources.get(source_name).is_some_and(|s| s.muted) {
                    return Err(DomainError::invariant(format!(
                        "source `{source_name}` is already muted"
                    ))
                    .into());
                }
                EventPayload::SourceMuted {
                    source_name: source_name.clone(),
                }
            }
            CommandKind::UnmuteSource { source_name } => {
                if !state.sources.get(source_name).is_some_and(|s| s.muted) {
                    return Err(DomainError::invariant(format!(
                        "source `{source_name}` is not muted"
                    ))
                    .into());
                }
                EventPayload::SourceUnmuted {
                    source_name: source_name.clone(),
                }
            }
            other => {
                return Err(DomainError::validation(format!(
                    "source handler cannot decide `{}`",
                    other.name()
                ))
                .into());
            }
        };

        Ok(Decision::any(vec![DomainEvent::new(aggregate_id, payload)]))
    }
}
