use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scenelog_core::{AggregateId, CommandId, CorrelationId};

use crate::payload::Settings;

/// A request to change state (intent, not fact).
///
/// Commands are **transient**: they are never persisted. A handler turns an
/// accepted command into zero or more events, each stamped with the command's
/// correlation id, user id and `causation_id = command_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: CommandId,
    pub issued_at: DateTime<Utc>,
    pub correlation_id: Option<CorrelationId>,
    pub user_id: Option<String>,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            command_id: CommandId::new(),
            issued_at: Utc::now(),
            correlation_id: None,
            user_id: None,
            kind,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// The aggregate this command targets.
    pub fn aggregate_id(&self) -> AggregateId {
        self.kind.aggregate_id()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandKind {
    SwitchScene {
        scene_name: String,
        #[serde(default)]
        transition_type: Option<String>,
        #[serde(default)]
        transition_duration: Option<u64>,
    },
    CreateScene {
        scene_name: String,
        #[serde(default)]
        scene_settings: Settings,
    },
    RemoveScene {
        scene_name: String,
    },
    RenameScene {
        old_name: String,
        new_name: String,
    },
    StartStream {
        #[serde(default)]
        stream_settings: Settings,
        #[serde(default)]
        service: Option<String>,
    },
    StopStream {
        #[serde(default)]
        total_frames: u64,
        #[serde(default)]
        dropped_frames: u64,
        #[serde(default)]
        bytes_sent: u64,
    },
    StartRecording {
        #[serde(default)]
        output_path: Option<String>,
        #[serde(default)]
        format: Option<String>,
    },
    StopRecording {
        #[serde(default)]
        file_size_bytes: u64,
    },
    SetSourceVolume {
        source_name: String,
        volume: f64,
        #[serde(default)]
        volume_db: Option<f64>,
    },
    MuteSource {
        source_name: String,
    },
    UnmuteSource {
        source_name: String,
    },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::SwitchScene { .. } => "switch_scene",
            CommandKind::CreateScene { .. } => "create_scene",
            CommandKind::RemoveScene { .. } => "remove_scene",
            CommandKind::RenameScene { .. } => "rename_scene",
            CommandKind::StartStream { .. } => "start_stream",
            CommandKind::StopStream { .. } => "stop_stream",
            CommandKind::StartRecording { .. } => "start_recording",
            CommandKind::StopRecording { .. } => "stop_recording",
            CommandKind::SetSourceVolume { .. } => "set_source_volume",
            CommandKind::MuteSource { .. } => "mute_source",
            CommandKind::UnmuteSource { .. } => "unmute_source",
        }
    }

    pub fn aggregate_id(&self) -> AggregateId {
        match self {
            CommandKind::SwitchScene { scene_name, .. }
            | CommandKind::CreateScene { scene_name, .. }
            | CommandKind::RemoveScene { scene_name } => AggregateId::scene(scene_name),
            CommandKind::RenameScene { old_name, .. } => AggregateId::scene(old_name),
            CommandKind::StartStream { .. } | CommandKind::StopStream { .. } => {
                AggregateId::stream()
            }
            CommandKind::StartRecording { .. } | CommandKind::StopRecording { .. } => {
                AggregateId::recording()
            }
            CommandKind::SetSourceVolume { source_name, .. }
            | CommandKind::MuteSource { source_name }
            | CommandKind::UnmuteSource { source_name } => AggregateId::source(source_name),
        }
    }
}
