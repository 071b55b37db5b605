use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version of every event payload.
///
/// Snapshots record the schema they were folded under; a snapshot taken under
/// a different schema is never used to skip replay.
pub const SCHEMA_VERSION: u32 = 1;

/// Closed set of event types.
///
/// Each variant corresponds to exactly one `EventPayload` variant and has a
/// stable wire name (`scene.created`, `stream.stopped`, ...).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "scene.created")]
    SceneCreated,
    #[serde(rename = "scene.switched")]
    SceneSwitched,
    #[serde(rename = "scene.removed")]
    SceneRemoved,
    #[serde(rename = "scene.renamed")]
    SceneRenamed,
    #[serde(rename = "source.created")]
    SourceCreated,
    #[serde(rename = "source.volume_changed")]
    SourceVolumeChanged,
    #[serde(rename = "source.muted")]
    SourceMuted,
    #[serde(rename = "source.unmuted")]
    SourceUnmuted,
    #[serde(rename = "stream.started")]
    StreamStarted,
    #[serde(rename = "stream.stopped")]
    StreamStopped,
    #[serde(rename = "recording.started")]
    RecordingStarted,
    #[serde(rename = "recording.stopped")]
    RecordingStopped,
    #[serde(rename = "automation.rule_created")]
    AutomationRuleCreated,
    #[serde(rename = "automation.rule_triggered")]
    AutomationRuleTriggered,
    #[serde(rename = "automation.rule_executed")]
    AutomationRuleExecuted,
    #[serde(rename = "automation.rule_failed")]
    AutomationRuleFailed,
    #[serde(rename = "system.connected")]
    SystemConnected,
    #[serde(rename = "system.disconnected")]
    SystemDisconnected,
    #[serde(rename = "system.error")]
    SystemError,
    #[serde(rename = "system.performance_warning")]
    SystemPerformanceWarning,
}

impl EventType {
    pub const ALL: [EventType; 20] = [
        EventType::SceneCreated,
        EventType::SceneSwitched,
        EventType::SceneRemoved,
        EventType::SceneRenamed,
        EventType::SourceCreated,
        EventType::SourceVolumeChanged,
        EventType::SourceMuted,
        EventType::SourceUnmuted,
        EventType::StreamStarted,
        EventType::StreamStopped,
        EventType::RecordingStarted,
        EventType::RecordingStopped,
        EventType::AutomationRuleCreated,
        EventType::AutomationRuleTriggered,
        EventType::AutomationRuleExecuted,
        EventType::AutomationRuleFailed,
        EventType::SystemConnected,
        EventType::SystemDisconnected,
        EventType::SystemError,
        EventType::SystemPerformanceWarning,
    ];

    /// Stable wire name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SceneCreated => "scene.created",
            EventType::SceneSwitched => "scene.switched",
            EventType::SceneRemoved => "scene.removed",
            EventType::SceneRenamed => "scene.renamed",
            EventType::SourceCreated => "source.created",
            EventType::SourceVolumeChanged => "source.volume_changed",
            EventType::SourceMuted => "source.muted",
            EventType::SourceUnmuted => "source.unmuted",
            EventType::StreamStarted => "stream.started",
            EventType::StreamStopped => "stream.stopped",
            EventType::RecordingStarted => "recording.started",
            EventType::RecordingStopped => "recording.stopped",
            EventType::AutomationRuleCreated => "automation.rule_created",
            EventType::AutomationRuleTriggered => "automation.rule_triggered",
            EventType::AutomationRuleExecuted => "automation.rule_executed",
            EventType::AutomationRuleFailed => "automation.rule_failed",
            EventType::SystemConnected => "system.connected",
            EventType::SystemDisconnected => "system.disconnected",
            EventType::SystemError => "system.error",
            EventType::SystemPerformanceWarning => "system.performance_warning",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a wire name does not belong to the closed event set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event type identifier.
    fn event_type(&self) -> EventType;

    /// Schema version for this event.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
