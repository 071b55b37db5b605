use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scenelog_events::{EventEnvelope, EventPayload, EventType, Projection, UNKNOWN_SCENE};

/// Scene usage: what is live now, what was live before, and for how long
/// each scene has been on air.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneView {
    pub current_scene: String,
    pub previous_scene: Option<String>,
    /// Known scenes in creation order.
    pub scenes: Vec<String>,
    pub scene_switch_count: u64,
    pub last_switch_time: Option<DateTime<Utc>>,
    /// Cumulative seconds on air, credited when switching away.
    pub scene_durations: BTreeMap<String, f64>,
    pub most_used_scene: Option<String>,
}

impl Default for SceneView {
    fn default() -> Self {
        Self {
            current_scene: UNKNOWN_SCENE.to_string(),
            previous_scene: None,
            scenes: Vec::new(),
            scene_switch_count: 0,
            last_switch_time: None,
            scene_durations: BTreeMap::new(),
            most_used_scene: None,
        }
    }
}

impl SceneView {
    fn refresh_most_used(&mut self) {
        self.most_used_scene = self
            .scene_durations
            .iter()
            .fold(None::<(&String, f64)>, |best, (name, secs)| match best {
                Some((_, top)) if top >= *secs => best,
                _ => Some((name, *secs)),
            })
            .map(|(name, _)| name.clone());
    }

    fn rename(&mut self, old_name: &str, new_name: &str) {
        for scene in self.scenes.iter_mut().filter(|s| s.as_str() == old_name) {
            *scene = new_name.to_string();
        }
        if self.current_scene == old_name {
            self.current_scene = new_name.to_string();
        }
        if self.previous_scene.as_deref() == Some(old_name) {
            self.previous_scene = Some(new_name.to_string());
        }
        if let Some(secs) = self.scene_durations.remove(old_name) {
            *self.scene_durations.entry(new_name.to_string()).or_default() += secs;
        }
        self.refresh_most_used();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SceneProjection;

impl SceneProjection {
    pub const NAME: &'static str = "scenes";
}

impl Projection for SceneProjection {
    type State = SceneView;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn initial_state(&self) -> SceneView {
        SceneView::default()
    }

    fn can_handle(&self, event: &EventEnvelope) -> bool {
        matches!(
            event.event_type(),
            EventType::SceneCreated
                | EventType::SceneSwitched
                | EventType::SceneRemoved
                | EventType::SceneRenamed
        )
    }

    fn handle_event(&self, state: &mut SceneView, event: &EventEnvelope) {
        match &event.event().payload {
            EventPayload::SceneCreated { scene_name, .. } => {
                if !state.scenes.contains(scene_name) {
                    state.scenes.push(scene_name.clone());
                }
            }
            EventPayload::SceneSwitched { to_scene, .. } => {
                let now = event.timestamp();
                let left = std::mem::replace(&mut state.current_scene, to_scene.clone());

                if let Some(since) = state.last_switch_time {
                    let secs = (now - since).num_milliseconds().max(0) as f64 / 1000.0;
                    *state.scene_durations.entry(left.clone()).or_default() += secs;
                    state.refresh_most_used();
                }

                state.previous_scene = Some(left);
                state.scene_switch_count += 1;
                state.last_switch_time = Some(now);
            }
            EventPayload::SceneRemoved { scene_name } => {
                state.scenes.retain(|s| s != scene_name);
            }
            EventPayload::SceneRenamed { old_name, new_name } => {
                state.rename(old_name, new_name);
            }
            _ => {}
        }
    }
}
