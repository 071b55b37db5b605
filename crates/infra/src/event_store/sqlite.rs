//! SQLite-backed event log.
//!
//! Events are written one row per envelope with the global position and the
//! per-aggregate version assigned by the store, so a reopened log replays in
//! exactly the original order.
//!
//! ## Error Mapping
//!
//! | SQLx Error | EventStoreError | Scenario |
//! |------------|-----------------|----------|
//! | Database (unique violation on `event_id`) | `DuplicateEvent` | Same event appended twice |
//! | Database (unique violation, other) | `Concurrency` | Position or `(aggregate_id, version)` already taken |
//! | Database (other) / PoolClosed / Io | `Storage` | Disk, lock or connection failures |
//! | Decode failures | `Corrupt` | Stored row no longer decodes into an event |

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use scenelog_core::{AggregateId, CausationId, CorrelationId, EventId};
use scenelog_events::{
    DomainEvent, EventEnvelope, EventMetadata, EventPayload, EventType, Snapshot,
};

use super::r#trait::{EventLog, EventStoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        event_id        TEXT PRIMARY KEY,
        position        INTEGER NOT NULL UNIQUE,
        aggregate_id    TEXT NOT NULL,
        event_type      TEXT NOT NULL,
        payload         TEXT NOT NULL,
        timestamp       TEXT NOT NULL,
        version         INTEGER NOT NULL,
        schema_version  INTEGER NOT NULL,
        correlation_id  TEXT NULL,
        causation_id    TEXT NULL,
        user_id         TEXT NULL,
        source          TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_aggregate ON events (aggregate_id, version)",
    "CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        aggregate_id    TEXT NOT NULL,
        version         INTEGER NOT NULL,
        schema_version  INTEGER NOT NULL,
        state           TEXT NOT NULL,
        timestamp       TEXT NOT NULL,
        PRIMARY KEY (aggregate_id, version)
    )
    "#,
];

/// SQLite-backed append-only event log.
///
/// `SqlitePool` is `Send + Sync` and cheap to clone.
#[derive(Debug, Clone)]
pub struct SqliteEventLog {
    pool: SqlitePool,
}

impl SqliteEventLog {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EventStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EventStoreError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open", e))?;

        Self::with_pool(pool).await
    }

    /// A private in-memory database (one connection, so every query sees it).
    pub async fn in_memory() -> Result<Self, EventStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("in_memory", e))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("in_memory", e))?;

        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, creating tables and indexes if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, EventStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl EventLog for SqliteEventLog {
    #[instrument(skip(self), err)]
    async fn load_all(&self) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                position,
                aggregate_id,
                event_type,
                payload,
                timestamp,
                version,
                schema_version,
                correlation_id,
                causation_id,
                user_id,
                source
            FROM events
            ORDER BY position ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_all", e))?;

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            envelopes.push(envelope_from_row(&row)?);
        }

        tracing::debug!(event_count = envelopes.len(), "loaded event log");
        Ok(envelopes)
    }

    #[instrument(
        skip(self, envelope),
        fields(
            position = envelope.position(),
            aggregate_id = %envelope.aggregate_id(),
            event_type = %envelope.event_type()
        ),
        err
    )]
    async fn append(&self, envelope: &EventEnvelope) -> Result<(), EventStoreError> {
        let event = envelope.event();
        let meta = &event.metadata;
        let payload = serde_json::to_string(&event.data())?;

        sqlx::query(
            r#"
            INSERT INTO events (
                event_id,
                position,
                aggregate_id,
                event_type,
                payload,
                timestamp,
                version,
                schema_version,
                correlation_id,
                causation_id,
                user_id,
                source
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(meta.event_id.to_string())
        .bind(envelope.position() as i64)
        .bind(event.aggregate_id.as_str())
        .bind(event.event_type().as_str())
        .bind(payload)
        .bind(format_timestamp(meta.timestamp))
        .bind(envelope.version() as i64)
        .bind(meta.schema_version as i64)
        .bind(meta.correlation_id.map(|id| id.to_string()))
        .bind(meta.causation_id.map(|id| id.to_string()))
        .bind(meta.user_id.as_deref())
        .bind(meta.source.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) && e.to_string().contains("event_id") {
                EventStoreError::DuplicateEvent(meta.event_id)
            } else {
                map_sqlx_error("append", e)
            }
        })?;

        Ok(())
    }

    #[instrument(
        skip(self, snapshot),
        fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.version),
        err
    )]
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), EventStoreError> {
        let state = serde_json::to_string(&snapshot.state)?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, version, schema_version, state, timestamp)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (aggregate_id, version)
            DO UPDATE SET
                schema_version = excluded.schema_version,
                state = excluded.state,
                timestamp = excluded.timestamp
            "#,
        )
        .bind(snapshot.aggregate_id.as_str())
        .bind(snapshot.version as i64)
        .bind(snapshot.schema_version as i64)
        .bind(state)
        .bind(format_timestamp(snapshot.timestamp))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_snapshot", e))?;

        Ok(())
    }

    async fn load_snapshots(&self) -> Result<Vec<Snapshot>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_id, version, schema_version, state, timestamp
            FROM snapshots
            ORDER BY aggregate_id ASC, version ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_snapshots", e))?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

impl SqliteEventLog {
    /// Latest snapshot row for one aggregate regardless of schema.
    pub async fn latest_snapshot(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_id, version, schema_version, state, timestamp
            FROM snapshots
            WHERE aggregate_id = ?
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_snapshot", e))?;

        row.as_ref().map(snapshot_from_row).transpose()
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, EventStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| EventStoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_field<T>(field: &str, raw: &str) -> Result<T, EventStoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| EventStoreError::Corrupt(format!("bad {field} {raw:?}: {e}")))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, EventStoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| EventStoreError::Corrupt(format!("failed to read column {name}: {e}")))
}

fn envelope_from_row(row: &SqliteRow) -> Result<EventEnvelope, EventStoreError> {
    let event_type: EventType = parse_field("event_type", &column::<String>(row, "event_type")?)?;
    let data: serde_json::Value = serde_json::from_str(&column::<String>(row, "payload")?)
        .map_err(|e| EventStoreError::Corrupt(format!("bad payload json: {e}")))?;
    let payload = EventPayload::from_parts(event_type, data)
        .map_err(|e| EventStoreError::Corrupt(format!("payload does not match {event_type}: {e}")))?;

    let correlation_id = column::<Option<String>>(row, "correlation_id")?
        .map(|raw| parse_field::<CorrelationId>("correlation_id", &raw))
        .transpose()?;
    let causation_id = column::<Option<String>>(row, "causation_id")?
        .map(|raw| parse_field::<CausationId>("causation_id", &raw))
        .transpose()?;

    let metadata = EventMetadata {
        event_id: parse_field::<EventId>("event_id", &column::<String>(row, "event_id")?)?,
        timestamp: parse_timestamp(&column::<String>(row, "timestamp")?)?,
        schema_version: column::<i64>(row, "schema_version")? as u32,
        correlation_id,
        causation_id,
        user_id: column(row, "user_id")?,
        source: column(row, "source")?,
    };

    let event = DomainEvent {
        aggregate_id: parse_field("aggregate_id", &column::<String>(row, "aggregate_id")?)?,
        metadata,
        payload,
    };

    Ok(EventEnvelope::new(
        column::<i64>(row, "position")? as u64,
        column::<i64>(row, "version")? as u64,
        event,
    ))
}

fn snapshot_from_row(row: &SqliteRow) -> Result<Snapshot, EventStoreError> {
    let state = serde_json::from_str(&column::<String>(row, "state")?)
        .map_err(|e| EventStoreError::Corrupt(format!("bad snapshot json: {e}")))?;
    Ok(Snapshot {
        aggregate_id: parse_field("aggregate_id", &column::<String>(row, "aggregate_id")?)?,
        version: column::<i64>(row, "version")? as u64,
        timestamp: parse_timestamp(&column::<String>(row, "timestamp")?)?,
        schema_version: column::<i64>(row, "schema_version")? as u32,
        state,
    })
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            if db_err.is_unique_violation() {
                EventStoreError::Concurrency(msg)
            } else {
                EventStoreError::Storage(msg)
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
