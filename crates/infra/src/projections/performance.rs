use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use scenelog_events::{EventEnvelope, EventType, Projection};

/// Events seen within trailing windows ending at the newest event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRate {
    pub last_minute: u64,
    pub last_hour: u64,
    pub last_day: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceView {
    pub event_counts_by_type: BTreeMap<EventType, u64>,
    /// Index is the UTC hour of day.
    pub hourly_counts: Vec<u64>,
    pub busiest_hour: Option<u32>,
    pub event_rate: EventRate,
    /// Highest `event_rate.last_minute` ever observed.
    pub peak_event_rate: u64,
    pub error_count: u64,
    pub warning_count: u64,
    pub newest_event: Option<DateTime<Utc>>,
    /// Timestamps inside the last day, kept for the rate windows.
    #[serde(skip)]
    window: VecDeque<DateTime<Utc>>,
}

impl Default for PerformanceView {
    fn default() -> Self {
        Self {
            event_counts_by_type: BTreeMap::new(),
            hourly_counts: vec![0; 24],
            busiest_hour: None,
            event_rate: EventRate::default(),
            peak_event_rate: 0,
            error_count: 0,
            warning_count: 0,
            newest_event: None,
            window: VecDeque::new(),
        }
    }
}

impl PerformanceView {
    fn record_time(&mut self, at: DateTime<Utc>) {
        let newest = self.newest_event.map_or(at, |n| n.max(at));
        self.newest_event = Some(newest);

        self.window.push_back(at);
        let day_ago = newest - Duration::days(1);
        self.window.retain(|t| *t > day_ago);

        let within = |span: Duration| {
            let from = newest - span;
            self.window.iter().filter(|t| **t > from).count() as u64
        };
        self.event_rate = EventRate {
            last_minute: within(Duration::minutes(1)),
            last_hour: within(Duration::hours(1)),
            last_day: self.window.len() as u64,
        };
        self.peak_event_rate = self.peak_event_rate.max(self.event_rate.last_minute);
    }

    /// Earliest hour wins ties.
    fn refresh_busiest_hour(&mut self) {
        self.busiest_hour = self
            .hourly_counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .fold(None::<(usize, u64)>, |best, (hour, count)| match best {
                Some((_, top)) if top >= *count => best,
                _ => Some((hour, *count)),
            })
            .map(|(hour, _)| hour as u32);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PerformanceProjection;

impl PerformanceProjection {
    pub const NAME: &'static str = "performance";
}

impl Projection for PerformanceProjection {
    type State = PerformanceView;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn initial_state(&self) -> PerformanceView {
        PerformanceView::default()
    }

    fn handle_event(&self, state: &mut PerformanceView, event: &EventEnvelope) {
        let event_type = event.event_type();
        let at = event.timestamp();

        *state.event_counts_by_type.entry(event_type).or_default() += 1;

        let hour = at.hour() as usize;
        if let Some(count) = state.hourly_counts.get_mut(hour) {
            *count += 1;
        }
        state.refresh_busiest_hour();

        match event_type {
            EventType::SystemError => state.error_count += 1,
            EventType::SystemPerformanceWarning => state.warning_count += 1,
            _ => {}
        }

        state.record_time(at);
    }
}
