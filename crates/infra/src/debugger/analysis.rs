use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use scenelog_core::AggregateId;
use scenelog_events::{EventEnvelope, EventType};

/// How many aggregates `SessionStatistics::most_active_aggregates` lists.
pub const TOP_AGGREGATES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub total_events: usize,
    pub event_types: BTreeMap<EventType, usize>,
    /// Busiest first; ties by aggregate id.
    pub most_active_aggregates: Vec<(AggregateId, usize)>,
    /// Events per second over the session span (at least one second).
    pub event_rate_per_second: f64,
    pub unique_correlations: usize,
    pub time_span_seconds: f64,
}

/// `events` must be in timestamp order.
pub fn statistics(events: &[EventEnvelope]) -> SessionStatistics {
    let mut event_types = BTreeMap::new();
    let mut aggregates: HashMap<&AggregateId, usize> = HashMap::new();
    let mut correlations = BTreeSet::new();
    for envelope in events {
        *event_types.entry(envelope.event_type()).or_insert(0) += 1;
        *aggregates.entry(envelope.aggregate_id()).or_insert(0) += 1;
        if let Some(correlation_id) = envelope.event().metadata.correlation_id {
            correlations.insert(correlation_id);
        }
    }

    let mut most_active: Vec<(AggregateId, usize)> = aggregates
        .into_iter()
        .map(|(id, count)| (id.clone(), count))
        .collect();
    most_active.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    most_active.truncate(TOP_AGGREGATES);

    let span = match (events.first(), events.last()) {
        (Some(first), Some(last)) => last.timestamp() - first.timestamp(),
        _ => Duration::zero(),
    };
    let span_seconds = span.num_milliseconds() as f64 / 1000.0;
    let event_rate = if events.len() > 1 {
        events.len() as f64 / span_seconds.max(1.0)
    } else {
        0.0
    };

    SessionStatistics {
        total_events: events.len(),
        event_types,
        most_active_aggregates: most_active,
        event_rate_per_second: event_rate,
        unique_correlations: correlations.len(),
        time_span_seconds: span_seconds,
    }
}

/// Every window of consecutive events whose types equal `pattern` in order,
/// optionally spanning no more than `within`. Windows may overlap.
pub fn find_pattern(
    events: &[EventEnvelope],
    pattern: &[EventType],
    within: Option<Duration>,
) -> Vec<Vec<EventEnvelope>> {
    if pattern.is_empty() {
        return Vec::new();
    }
    events
        .windows(pattern.len())
        .filter(|window| {
            window
                .iter()
                .zip(pattern)
                .all(|(envelope, expected)| envelope.event_type() == *expected)
        })
        .filter(|window| {
            within.is_none_or(|limit| {
                match (window.first(), window.last()) {
                    (Some(first), Some(last)) => last.timestamp() - first.timestamp() <= limit,
                    _ => true,
                }
            })
        })
        .map(<[EventEnvelope]>::to_vec)
        .collect()
}
