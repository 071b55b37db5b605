//! Whole-system fold shared by the debugger, what-if analysis, aggregate-state
//! queries and automatic snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::DomainEvent;
use crate::payload::{EventPayload, Settings};

pub const UNKNOWN_SCENE: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub source_type: Option<String>,
    pub settings: Settings,
    pub scene_name: Option<String>,
    pub volume: Option<f64>,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub rule_name: String,
    pub trigger_count: u64,
    pub execution_count: u64,
    pub failure_count: u64,
}

/// State of the controlled application reconstructed purely from events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub current_scene: String,
    pub is_streaming: bool,
    pub is_recording: bool,
    /// Known scenes in creation order, without duplicates.
    pub scenes: Vec<String>,
    pub sources: BTreeMap<String, SourceSnapshot>,
    pub automation_rules: BTreeMap<String, RuleSnapshot>,
    pub event_count: u64,
    pub last_event: Option<DomainEvent>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            current_scene: UNKNOWN_SCENE.to_string(),
            is_streaming: false,
            is_recording: false,
            scenes: Vec::new(),
            sources: BTreeMap::new(),
            automation_rules: BTreeMap::new(),
            event_count: 0,
            last_event: None,
        }
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a sequence of events from the empty state.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a DomainEvent>) -> Self {
        let mut state = Self::new();
        state.apply_all(events);
        state
    }

    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a DomainEvent>) {
        for event in events {
            self.apply(event);
        }
    }

    pub fn apply(&mut self, event: &DomainEvent) {
        match &event.payload {
            EventPayload::SceneCreated { scene_name, .. } => {
                if !self.scenes.contains(scene_name) {
                    self.scenes.push(scene_name.clone());
                }
            }
            EventPayload::SceneSwitched { to_scene, .. } => {
                self.current_scene = to_scene.clone();
            }
            EventPayload::SceneRemoved { scene_name } => {
                self.scenes.retain(|s| s != scene_name);
            }
            EventPayload::SceneRenamed { old_name, new_name } => {
                for scene in self.scenes.iter_mut().filter(|s| s.as_str() == old_name.as_str()) {
                    *scene = new_name.clone();
                }
                if &self.current_scene == old_name {
                    self.current_scene = new_name.clone();
                }
            }
            EventPayload::SourceCreated {
                source_name,
                source_type,
                source_settings,
                scene_name,
            } => {
                let source = self.sources.entry(source_name.clone()).or_default();
                source.source_type = Some(source_type.clone());
                source.settings = source_settings.clone();
                source.scene_name = scene_name.clone();
            }
            EventPayload::SourceVolumeChanged {
                source_name,
                new_volume,
                ..
            } => {
                self.sources.entry(source_name.clone()).or_default().volume = Some(*new_volume);
            }
            EventPayload::SourceMuted { source_name } => {
                self.sources.entry(source_name.clone()).or_default().muted = true;
            }
            EventPayload::SourceUnmuted { source_name } => {
                self.sources.entry(source_name.clone()).or_default().muted = false;
            }
            EventPayload::StreamStarted { .. } => self.is_streaming = true,
            EventPayload::StreamStopped { .. } => self.is_streaming = false,
            EventPayload::RecordingStarted { .. } => self.is_recording = true,
            EventPayload::RecordingStopped { .. } => self.is_recording = false,
            EventPayload::AutomationRuleCreated { rule_id, rule_name } => {
                self.rule(rule_id, rule_name);
            }
            EventPayload::AutomationRuleTriggered {
                rule_id, rule_name, ..
            } => self.rule(rule_id, rule_name).trigger_count += 1,
            EventPayload::AutomationRuleExecuted {
                rule_id, rule_name, ..
            } => self.rule(rule_id, rule_name).execution_count += 1,
            EventPayload::AutomationRuleFailed {
                rule_id, rule_name, ..
            } => self.rule(rule_id, rule_name).failure_count += 1,
            EventPayload::SystemConnected { .. }
            | EventPayload::SystemDisconnected { .. }
            | EventPayload::SystemError { .. }
            | EventPayload::SystemPerformanceWarning { .. } => {}
        }

        self.event_count += 1;
        self.last_event = Some(event.clone());
    }

    fn rule(&mut self, rule_id: &str, rule_name: &str) -> &mut RuleSnapshot {
        self.automation_rules
            .entry(rule_id.to_string())
            .or_insert_with(|| RuleSnapshot {
                rule_name: rule_name.to_string(),
                ..RuleSnapshot::default()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenelog_core::AggregateId;

    fn ev(aggregate: AggregateId, payload: EventPayload) -> DomainEvent {
        DomainEvent::new(aggregate, payload)
    }

    #[test]
    fn empty_fold_is_unknown_scene() {
        let state = SystemState::from_events(std::iter::empty());
        assert_eq!(state.current_scene, UNKNOWN_SCENE);
        assert_eq!(state.event_count, 0);
        assert!(state.last_event.is_none());
    }

    #[test]
    fn folds_scene_stream_and_source_changes() {
        let events = vec![
            ev(
                AggregateId::scene("Main"),
                EventPayload::SceneCreated { scene_name: "Main".into(), scene_settings: Settings::new() },
            ),
            ev(
                AggregateId::scene("Main"),
                EventPayload::SceneCreated { scene_name: "Main".into(), scene_settings: Settings::new() },
            ),
            ev(
                AggregateId::scene("Main"),
                EventPayload::SceneSwitched {
                    from_scene: UNKNOWN_SCENE.into(),
                    to_scene: "Main".into(),
                    transition_type: None,
                    transition_duration: None,
                },
            ),
            ev(AggregateId::stream(), EventPayload::StreamStarted { stream_settings: Settings::new(), service: None }),
            ev(AggregateId::source("Mic"), EventPayload::SourceMuted { source_name: "Mic".into() }),
            ev(
                AggregateId::scene("Main"),
                EventPayload::SceneRenamed { old_name: "Main".into(), new_name: "Live".into() },
            ),
        ];
        let state = SystemState::from_events(&events);
        assert_eq!(state.scenes, vec!["Live".to_string()]);
        assert_eq!(state.current_scene, "Live");
        assert!(state.is_streaming);
        assert!(state.sources["Mic"].muted);
        assert_eq!(state.event_count, 6);
        assert_eq!(state.last_event.as_ref(), events.last());
    }

    #[test]
    fn rules_register_implicitly() {
        let state = SystemState::from_events(&[ev(
            AggregateId::rule("intro"),
            EventPayload::AutomationRuleFailed {
                rule_id: "intro".into(),
                rule_name: "Intro".into(),
                error: "timeout".into(),
            },
        )]);
        assert_eq!(state.automation_rules["intro"].failure_count, 1);
        assert_eq!(state.automation_rules["intro"].rule_name, "Intro");
    }
}
