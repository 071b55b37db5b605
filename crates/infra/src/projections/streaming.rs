use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scenelog_events::{EventEnvelope, EventPayload, EventType, Projection};

/// Completed runs kept in [`StreamingView::stream_history`].
pub const STREAM_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRun {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub duration: u64,
    pub frames: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingView {
    pub is_streaming: bool,
    pub stream_start_time: Option<DateTime<Utc>>,
    pub stream_count: u64,
    /// Seconds.
    pub total_stream_time: u64,
    pub total_frames: u64,
    pub dropped_frames: u64,
    pub bytes_sent: u64,
    pub average_stream_duration: f64,
    pub longest_stream_duration: u64,
    /// Oldest first.
    pub stream_history: Vec<StreamRun>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingProjection;

impl StreamingProjection {
    pub const NAME: &'static str = "streaming";
}

impl Projection for StreamingProjection {
    type State = StreamingView;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn initial_state(&self) -> StreamingView {
        StreamingView::default()
    }

    fn can_handle(&self, event: &EventEnvelope) -> bool {
        matches!(
            event.event_type(),
            EventType::StreamStarted | EventType::StreamStopped
        )
    }

    fn handle_event(&self, state: &mut StreamingView, event: &EventEnvelope) {
        match &event.event().payload {
            EventPayload::StreamStarted { .. } => {
                state.is_streaming = true;
                state.stream_start_time = Some(event.timestamp());
                state.stream_count += 1;
            }
            EventPayload::StreamStopped {
                duration_seconds,
                total_frames,
                dropped_frames,
                bytes_sent,
            } => {
                state.is_streaming = false;
                // Totals come from the encoder; clamp instead of overflowing.
                state.total_stream_time = state.total_stream_time.saturating_add(*duration_seconds);
                state.total_frames = state.total_frames.saturating_add(*total_frames);
                state.dropped_frames = state.dropped_frames.saturating_add(*dropped_frames);
                state.bytes_sent = state.bytes_sent.saturating_add(*bytes_sent);
                if state.stream_count > 0 {
                    state.average_stream_duration =
                        state.total_stream_time as f64 / state.stream_count as f64;
                }
                state.longest_stream_duration = state.longest_stream_duration.max(*duration_seconds);

                state.stream_history.push(StreamRun {
                    start_time: state.stream_start_time.take(),
                    end_time: event.timestamp(),
                    duration: *duration_seconds,
                    frames: *total_frames,
                    dropped: *dropped_frames,
                });
                if state.stream_history.len() > STREAM_HISTORY_LIMIT {
                    let excess = state.stream_history.len() - STREAM_HISTORY_LIMIT;
                    state.stream_history.drain(..excess);
                }
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

    fn env(position: u64, payload: EventPayload) -> EventEnvelope {
        EventEnvelope::new(position, position, DomainEvent::new(AggregateId::stream(), payload))
    }

    fn started(position: u64) -> EventEnvelope {
        env(
            position,
            EventPayload::StreamStarted {
                stream_settings: Settings::new(),
                service: Some("twitch".into()),
            },
        )
    }

    fn stopped(position: u64, duration_seconds: u64) -> EventEnvelope {
        env(
            position,
            EventPayload::StreamStopped {
                duration_seconds,
                total_frames: 216_000,
                dropped_frames: 10,
                bytes_sent: 0,
            },
        )
    }

    #[test]
    fn one_hour_stream() {
        let log = vec![started(1), stopped(2, 3600)];
        let runner = ProjectionRunner::rebuild_from_scratch(StreamingProjection, &log);
        let view = runner.data();
        assert!(!view.is_streaming);
        assert_eq!(view.stream_count, 1);
        assert_eq!(view.total_stream_time, 3600);
        assert_eq!(view.total_frames, 216_000);
        assert_eq!(view.dropped_frames, 10);
        assert_eq!(view.average_stream_duration, 3600.0);
        assert_eq!(view.stream_history.len(), 1);
        assert!(view.stream_history[0].start_time.is_some());
        assert!(view.stream_start_time.is_none());
    }

    #[test]
    fn huge_totals_saturate() {
        let huge = |position| {
            env(
                position,
                EventPayload::StreamStopped {
                    duration_seconds: u64::MAX,
                    total_frames: u64::MAX,
                    dropped_frames: 1,
                    bytes_sent: u64::MAX,
                },
            )
        };
        let log = vec![started(1), huge(2), started(3), huge(4)];
        let runner = ProjectionRunner::rebuild_from_scratch(StreamingProjection, &log);
        let view = runner.data();
        assert_eq!(view.total_stream_time, u64::MAX);
        assert_eq!(view.total_frames, u64::MAX);
        assert_eq!(view.bytes_sent, u64::MAX);
        assert_eq!(view.dropped_frames, 2);
        assert_eq!(view.stream_history.len(), 2);
    }

    #[test]
    fn history_is_capped() {
        let mut log = Vec::new();
        for run in 0..(STREAM_HISTORY_LIMIT as u64 + 5) {
            log.push(started(run * 2 + 1));
            log.push(stopped(run * 2 + 2, run + 1));
        }
        let runner = ProjectionRunner::rebuild_from_scratch(StreamingProjection, &log);
        let view = runner.data();
        assert_eq!(view.stream_history.len(), STREAM_HISTORY_LIMIT);
        assert_eq!(view.stream_history[0].duration, 6);
        assert_eq!(view.longest_stream_duration, STREAM_HISTORY_LIMIT as u64 + 5);
    }
}
