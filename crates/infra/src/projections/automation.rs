use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scenelog_events::{EventEnvelope, EventPayload, EventType, Projection};

/// Executions kept in [`AutomationView::recent_executions`].
pub const RECENT_EXECUTIONS_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStats {
    pub name: String,
    pub trigger_count: u64,
    pub execution_count: u64,
    pub failure_count: u64,
    /// Milliseconds.
    pub total_execution_time: f64,
    pub enabled: bool,
}

impl RuleStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            trigger_count: 0,
            execution_count: 0,
            failure_count: 0,
            total_execution_time: 0.0,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentExecution {
    pub rule_id: String,
    pub rule_name: String,
    pub timestamp: DateTime<Utc>,
    pub execution_time_ms: f64,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationView {
    pub rules: BTreeMap<String, RuleStats>,
    pub total_triggers: u64,
    pub total_executions: u64,
    pub total_failures: u64,
    /// Milliseconds, over every execution seen.
    pub average_execution_time: f64,
    pub most_triggered_rule: Option<String>,
    /// Oldest first.
    pub recent_executions: Vec<RecentExecution>,
}

impl AutomationView {
    fn rule(&mut self, rule_id: &str, rule_name: &str) -> &mut RuleStats {
        self.rules
            .entry(rule_id.to_string())
            .or_insert_with(|| RuleStats::new(rule_name))
    }

    /// Highest trigger count; ties go to the smallest rule id.
    fn refresh_most_triggered(&mut self) {
        self.most_triggered_rule = self
            .rules
            .iter()
            .filter(|(_, r)| r.trigger_count > 0)
            .fold(None::<(&String, u64)>, |best, (id, r)| match best {
                Some((_, top)) if top >= r.trigger_count => best,
                _ => Some((id, r.trigger_count)),
            })
            .map(|(id, _)| id.clone());
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AutomationProjection;

impl AutomationProjection {
    pub const NAME: &'static str = "automation";
}

impl Projection for AutomationProjection {
    type State = AutomationView;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn initial_state(&self) -> AutomationView {
        AutomationView::default()
    }

    fn can_handle(&self, event: &EventEnvelope) -> bool {
        matches!(
            event.event_type(),
            EventType::AutomationRuleCreated
                | EventType::AutomationRuleTriggered
                | EventType::AutomationRuleExecuted
                | EventType::AutomationRuleFailed
        )
    }

    fn handle_event(&self, state: &mut AutomationView, event: &EventEnvelope) {
        match &event.event().payload {
            EventPayload::AutomationRuleCreated { rule_id, rule_name } => {
                state.rule(rule_id, rule_name);
            }
            EventPayload::AutomationRuleTriggered {
                rule_id, rule_name, ..
            } => {
                state.rule(rule_id, rule_name).trigger_count += 1;
                state.total_triggers += 1;
                state.refresh_most_triggered();
            }
            EventPayload::AutomationRuleExecuted {
                rule_id,
                rule_name,
                actions_executed,
                execution_time_ms,
                ..
            } => {
                let rule = state.rule(rule_id, rule_name);
                rule.execution_count += 1;
                rule.total_execution_time += execution_time_ms;
                state.total_executions += 1;

                let total_time: f64 = state.rules.values().map(|r| r.total_execution_time).sum();
                state.average_execution_time = total_time / state.total_executions as f64;

                state.recent_executions.push(RecentExecution {
                    rule_id: rule_id.clone(),
                    rule_name: rule_name.clone(),
                    timestamp: event.timestamp(),
                    execution_time_ms: *execution_time_ms,
                    actions: actions_executed.clone(),
                });
                if state.recent_executions.len() > RECENT_EXECUTIONS_LIMIT {
                    let excess = state.recent_executions.len() - RECENT_EXECUTIONS_LIMIT;
                    state.recent_executions.drain(..excess);
                }
            }
            EventPayload::AutomationRuleFailed {
                rule_id, rule_name, ..
            } => {
                state.rule(rule_id, rule_name).failure_count += 1;
                state.total_failures += 1;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenelog_core::AggregateId;
    use scenelog_events::{DomainEvent, ProjectionRunner, Settings};

    fn env(position: u64, rule_id: &str, payload: EventPayload) -> EventEnvelope {
        EventEnvelope::new(position, position, DomainEvent::new(AggregateId::rule(rule_id), payload))
    }

    fn triggered(position: u64, rule_id: &str) -> EventEnvelope {
        env(
            position,
            rule_id,
            EventPayload::AutomationRuleTriggered {
                rule_id: rule_id.into(),
                rule_name: format!("rule {rule_id}"),
                trigger_type: "scene".into(),
                trigger_data: Settings::new(),
            },
        )
    }

    fn executed(position: u64, rule_id: &str, ms: f64) -> EventEnvelope {
        env(
            position,
            rule_id,
            EventPayload::AutomationRuleExecuted {
                rule_id: rule_id.into(),
                rule_name: format!("rule {rule_id}"),
                actions_executed: vec!["mute".into()],
                execution_time_ms: ms,
                result: Settings::new(),
            },
        )
    }

    #[test]
    fn rules_register_on_first_sighting() {
        let log = vec![
            triggered(1, "intro"),
            executed(2, "intro", 10.0),
            triggered(3, "outro"),
            triggered(4, "outro"),
            executed(5, "outro", 30.0),
            env(
                6,
                "late",
                EventPayload::AutomationRuleFailed {
                    rule_id: "late".into(),
                    rule_name: "rule late".into(),
                    error: "timeout".into(),
                },
            ),
        ];
        let runner = ProjectionRunner::rebuild_from_scratch(AutomationProjection, &log);
        let view = runner.data();

        assert_eq!(view.rules.len(), 3);
        assert_eq!(view.rules["outro"].trigger_count, 2);
        assert_eq!(view.rules["late"].failure_count, 1);
        assert_eq!(view.total_triggers, 3);
        assert_eq!(view.total_executions, 2);
        assert_eq!(view.total_failures, 1);
        assert_eq!(view.average_execution_time, 20.0);
        assert_eq!(view.most_triggered_rule.as_deref(), Some("outro"));
        assert_eq!(view.recent_executions.len(), 2);
    }

    #[test]
    fn recent_executions_are_capped() {
        let log: Vec<_> = (1..=60).map(|p| executed(p, "intro", 1.0)).collect();
        let runner = ProjectionRunner::rebuild_from_scratch(AutomationProjection, &log);
        assert_eq!(runner.data().recent_executions.len(), RECENT_EXECUTIONS_LIMIT);
        assert_eq!(runner.data().rules["intro"].execution_count, 60);
    }
}
