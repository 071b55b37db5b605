//! Event payloads: one variant per `EventType`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::EventType;

/// Free-form settings carried by some events (scene/source/stream settings).
pub type Settings = Map<String, Value>;

/// The closed set of event payloads.
///
/// Serialized adjacently tagged: `{"event_type": "scene.created", "data": {...}}`.
/// The `data` object is what gets persisted in the `payload` column and what
/// `data()` exposes to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "scene.created")]
    SceneCreated {
        scene_name: String,
        #[serde(default)]
        scene_settings: Settings,
    },
    #[serde(rename = "scene.switched")]
    SceneSwitched {
        from_scene: String,
        to_scene: String,
        #[serde(default)]
        transition_type: Option<String>,
        /// Milliseconds.
        #[serde(default)]
        transition_duration: Option<u64>,
    },
    #[serde(rename = "scene.removed")]
    SceneRemoved { scene_name: String },
    #[serde(rename = "scene.renamed")]
    SceneRenamed { old_name: String, new_name: String },

    #[serde(rename = "source.created")]
    SourceCreated {
        source_name: String,
        source_type: String,
        #[serde(default)]
        source_settings: Settings,
        #[serde(default)]
        scene_name: Option<String>,
    },
    #[serde(rename = "source.volume_changed")]
    SourceVolumeChanged {
        source_name: String,
        old_volume: f64,
        new_volume: f64,
        #[serde(default)]
        volume_db: Option<f64>,
    },
    #[serde(rename = "source.muted")]
    SourceMuted { source_name: String },
    #[serde(rename = "source.unmuted")]
    SourceUnmuted { source_name: String },

    /// Stream keys are deliberately absent: only non-secret settings are recorded.
    #[serde(rename = "stream.started")]
    StreamStarted {
        #[serde(default)]
        stream_settings: Settings,
        #[serde(default)]
        service: Option<String>,
    },
    #[serde(rename = "stream.stopped")]
    StreamStopped {
        duration_seconds: u64,
        total_frames: u64,
        dropped_frames: u64,
        #[serde(default)]
        bytes_sent: u64,
    },

    #[serde(rename = "recording.started")]
    RecordingStarted {
        #[serde(default)]
        output_path: Option<String>,
        #[serde(default)]
        format: Option<String>,
    },
    #[serde(rename = "recording.stopped")]
    RecordingStopped {
        duration_seconds: u64,
        #[serde(default)]
        output_path: Option<String>,
        #[serde(default)]
        file_size_bytes: u64,
    },

    #[serde(rename = "automation.rule_created")]
    AutomationRuleCreated { rule_id: String, rule_name: String },
    #[serde(rename = "automation.rule_triggered")]
    AutomationRuleTriggered {
        rule_id: String,
        rule_name: String,
        trigger_type: String,
        #[serde(default)]
        trigger_data: Settings,
    },
    #[serde(rename = "automation.rule_executed")]
    AutomationRuleExecuted {
        rule_id: String,
        rule_name: String,
        #[serde(default)]
        actions_executed: Vec<String>,
        execution_time_ms: f64,
        #[serde(default)]
        result: Settings,
    },
    #[serde(rename = "automation.rule_failed")]
    AutomationRuleFailed {
        rule_id: String,
        rule_name: String,
        error: String,
    },

    #[serde(rename = "system.connected")]
    SystemConnected { host: String, port: u16 },
    #[serde(rename = "system.disconnected")]
    SystemDisconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "system.error")]
    SystemError { error_type: String, message: String },
    #[serde(rename = "system.performance_warning")]
    SystemPerformanceWarning {
        metric: String,
        value: f64,
        threshold: f64,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::SceneCreated { .. } => EventType::SceneCreated,
            EventPayload::SceneSwitched { .. } => EventType::SceneSwitched,
            EventPayload::SceneRemoved { .. } => EventType::SceneRemoved,
            EventPayload::SceneRenamed { .. } => EventType::SceneRenamed,
            EventPayload::SourceCreated { .. } => EventType::SourceCreated,
            EventPayload::SourceVolumeChanged { .. } => EventType::SourceVolumeChanged,
            EventPayload::SourceMuted { .. } => EventType::SourceMuted,
            EventPayload::SourceUnmuted { .. } => EventType::SourceUnmuted,
            EventPayload::StreamStarted { .. } => EventType::StreamStarted,
            EventPayload::StreamStopped { .. } => EventType::StreamStopped,
            EventPayload::RecordingStarted { .. } => EventType::RecordingStarted,
            EventPayload::RecordingStopped { .. } => EventType::RecordingStopped,
            EventPayload::AutomationRuleCreated { .. } => EventType::AutomationRuleCreated,
            EventPayload::AutomationRuleTriggered { .. } => EventType::AutomationRuleTriggered,
            EventPayload::AutomationRuleExecuted { .. } => EventType::AutomationRuleExecuted,
            EventPayload::AutomationRuleFailed { .. } => EventType::AutomationRuleFailed,
            EventPayload::SystemConnected { .. } => EventType::SystemConnected,
            EventPayload::SystemDisconnected { .. } => EventType::SystemDisconnected,
            EventPayload::SystemError { .. } => EventType::SystemError,
            EventPayload::SystemPerformanceWarning { .. } => EventType::SystemPerformanceWarning,
        }
    }

    /// The variant's fields as a JSON object.
    pub fn data(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut tagged)) => tagged.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Rebuild a payload from its stored parts (`event_type` column + `data` JSON).
    pub fn from_parts(event_type: EventType, data: Value) -> Result<Self, serde_json::Error> {
        let mut tagged = Map::with_capacity(2);
        tagged.insert("event_type".to_string(), Value::String(event_type.as_str().to_string()));
        tagged.insert("data".to_string(), data);
        serde_json::from_value(Value::Object(tagged))
    }

    /// Scene name this payload refers to, if any.
    pub fn scene_name(&self) -> Option<&str> {
        match self {
            EventPayload::SceneCreated { scene_name, .. }
            | EventPayload::SceneRemoved { scene_name } => Some(scene_name),
            EventPayload::SceneSwitched { to_scene, .. } => Some(to_scene),
            EventPayload::SceneRenamed { new_name, .. } => Some(new_name),
            EventPayload::SourceCreated { scene_name, .. } => scene_name.as_deref(),
            _ => None,
        }
    }

    /// Rule id this payload refers to, if any.
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            EventPayload::AutomationRuleCreated { rule_id, .. }
            | EventPayload::AutomationRuleTriggered { rule_id, .. }
            | EventPayload::AutomationRuleExecuted { rule_id, .. }
            | EventPayload::AutomationRuleFailed { rule_id, .. } => Some(rule_id),
            _ => None,
        }
    }
}
