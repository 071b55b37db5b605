//! Log export (JSON document or CSV).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use scenelog_core::{AggregateId, CausationId, CorrelationId, EventId};
use scenelog_events::{EventEnvelope, EventType};

use super::query::EventFilter;
use super::r#trait::EventStoreError;
use super::store::EventStore;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = EventStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(EventStoreError::Serialization(format!(
                "unsupported export format: {other}"
            ))),
        }
    }
}

/// One exported event with every metadata field flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedEvent {
    pub position: u64,
    pub version: u64,
    pub event_id: EventId,
    pub event_type: EventType,
    pub aggregate_id: AggregateId,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
    pub user_id: Option<String>,
    pub source: String,
    pub data: Value,
}

impl From<&EventEnvelope> for ExportedEvent {
    fn from(envelope: &EventEnvelope) -> Self {
        let meta = &envelope.event().metadata;
        Self {
            position: envelope.position(),
            version: envelope.version(),
            event_id: meta.event_id,
            event_type: envelope.event_type(),
            aggregate_id: envelope.aggregate_id().clone(),
            timestamp: meta.timestamp,
            schema_version: meta.schema_version,
            correlation_id: meta.correlation_id,
            causation_id: meta.causation_id,
            user_id: meta.user_id.clone(),
            source: meta.source.clone(),
            data: envelope.event().data(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub export_time: DateTime<Utc>,
    pub event_count: usize,
    pub events: Vec<ExportedEvent>,
}

pub const CSV_HEADER: &str = "position,timestamp,event_type,aggregate_id,version,event_id,correlation_id,causation_id,user_id,source,data";

impl EventStore {
    /// Export the durable log, optionally bounded in time (inclusive).
    pub async fn export(
        &self,
        format: ExportFormat,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<String, EventStoreError> {
        let events = self.load_durable(&EventFilter::between(since, until)).await?;
        tracing::info!(?format, event_count = events.len(), "exporting events");
        match format {
            ExportFormat::Json => to_json(&events),
            ExportFormat::Csv => Ok(to_csv(&events)),
        }
    }
}

pub fn to_json(events: &[EventEnvelope]) -> Result<String, EventStoreError> {
    let document = ExportDocument {
        export_time: Utc::now(),
        event_count: events.len(),
        events: events.iter().map(ExportedEvent::from).collect(),
    };
    Ok(serde_json::to_string_pretty(&document)?)
}

pub fn to_csv(events: &[EventEnvelope]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for envelope in events {
        let e = ExportedEvent::from(envelope);
        let fields = [
            e.position.to_string(),
            e.timestamp.to_rfc3339(),
            e.event_type.to_string(),
            e.aggregate_id.to_string(),
            e.version.to_string(),
            e.event_id.to_string(),
            e.correlation_id.map(|id| id.to_string()).unwrap_or_default(),
            e.causation_id.map(|id| id.to_string()).unwrap_or_default(),
            e.user_id.unwrap_or_default(),
            e.source,
            e.data.to_string(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// Quote a field when it contains a delimiter, quote or line break.
fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
