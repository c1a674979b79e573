//! Storage layer for the quota ledger.
//!
//! The [`EventLog`] is the single source of truth: an append-only table of
//! events plus the checkpoints, worker cursors, and usage rollups derived
//! from it, all in one `SQLite` file.
//!
//! # Thread Safety
//!
//! A `rusqlite::Connection` is `Send` but not `Sync`. [`EventLog`] keeps its
//! connection behind a `Mutex`, so one log can be shared between the engine
//! and its background workers through an `Arc`. Every public method takes the
//! lock once; multi-step operations such as pruning compute their safe cutoff
//! and delete under the same acquisition, so a concurrent snapshot can never
//! slip between the two.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 with microsecond precision and a
//! `Z` suffix (e.g. `2025-01-06T12:00:00.000000Z`). The fixed width keeps
//! lexicographic order identical to chronological order, which the ingest
//! ordering and the prune cutoff both rely on.
//!
//! ## Ordering
//!
//! Replay order is `ts_ingest` ascending with ties broken by insertion order
//! (`rowid`). The write path assigns strictly increasing ingest times, so
//! ties only appear in logs written by something else.
//!
//! ## Event Payload Storage
//!
//! The `payload` column stores the type-specific JSON body and `event_type`
//! its canonical string name. Payload shapes only ever gain optional fields.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use ql_core::{Correlation, Dimensions, Event, EventId, EventType, SnapshotId, Source, ValidationError};

/// Default cap on rows returned by [`EventLog::query`].
pub const DEFAULT_QUERY_LIMIT: usize = 1000;

/// Default number of rows returned by [`EventLog::read_recent`].
pub const DEFAULT_RECENT_LIMIT: usize = 50;

/// Upper bound on ids bound into one `IN (...)` clause.
const DELETE_CHUNK: usize = 500;

const EVENT_COLUMNS: &str = "event_id, event_type, schema_version, ts_event, ts_ingest, \
     origin_kind, origin_id, writer_id, agent_id, identity_id, workload_id, scope_id, \
     correlation_id, causation_id, payload, epoch";

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The event was rejected before it reached the database.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A keyed lookup that the caller expected to succeed found nothing.
    #[error("key not found: {key}")]
    NotFound { key: String },
    /// Pruning needs a snapshot to compute a safe cutoff.
    #[error("cannot prune: no snapshots found (create a snapshot first)")]
    NoSnapshot,
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp for {id}: {timestamp}")]
    TimestampParse {
        id: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored row does not decode into an event.
    #[error("invalid event data for {event_id}: {message}")]
    InvalidEventData { event_id: String, message: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Conjunctive filter for [`EventLog::query`]. The time range applies to
/// `ts_event` and is inclusive of `from`, exclusive of `to`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub event_types: Vec<EventType>,
    pub identity_id: Option<String>,
    pub scope_id: Option<String>,
    /// Defaults to [`DEFAULT_QUERY_LIMIT`].
    pub limit: Option<usize>,
}

/// Which event types a prune pass may remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TypeFilter {
    #[default]
    All,
    Only(EventType),
    Except(Vec<EventType>),
}

/// A durable checkpoint of every projection at `last_event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub schema_version: u32,
    pub ts_snapshot: DateTime<Utc>,
    pub last_event_id: EventId,
    pub payload: Value,
}

/// The newest snapshot and the ingest time of the event it points at.
///
/// Nothing at or after `ts_ingest` may be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBoundary {
    pub snapshot_id: SnapshotId,
    pub last_event_id: EventId,
    pub ts_snapshot: DateTime<Utc>,
    pub ts_ingest: DateTime<Utc>,
}

/// Latest ingest timestamp grouped by event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeLastEvent {
    pub event_type: String,
    pub last_ingest: String,
    pub count: i64,
}

/// Rollup granularity. Each has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Hour,
    Day,
}

impl Bucket {
    const fn table(self) -> &'static str {
        match self {
            Self::Hour => "usage_hourly",
            Self::Day => "usage_daily",
        }
    }

    fn width(self) -> TimeDelta {
        match self {
            Self::Hour => TimeDelta::hours(1),
            Self::Day => TimeDelta::days(1),
        }
    }

    /// The start of the bucket containing `ts`.
    pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.duration_trunc(self.width()).unwrap_or(ts)
    }
}

/// Aggregated `usage_observed` readings for one bucket and attribution key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageStat {
    pub bucket_ts: DateTime<Utc>,
    pub provider_id: String,
    pub pool_id: String,
    pub identity_id: String,
    pub scope_id: String,
    /// Spread between the highest and lowest `used` reading in the bucket.
    pub total_usage: i64,
    pub min_usage: i64,
    pub max_usage: i64,
    pub event_count: i64,
}

/// Filter for [`EventLog::usage_stats`]; `from` inclusive, `to` exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageFilter {
    pub bucket: Bucket,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub provider_id: Option<String>,
    pub pool_id: Option<String>,
    pub identity_id: Option<String>,
    pub scope_id: Option<String>,
}

/// Durable, append-only event log.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct EventLog {
    conn: Mutex<Connection>,
}

impl EventLog {
    /// Opens a log at the given path, creating it if necessary.
    ///
    /// Enables write-ahead logging and migrates the schema idempotently.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init()?;
        tracing::debug!(path = %path.display(), "opened event log");
        Ok(log)
    }

    /// Opens an in-memory log.
    ///
    /// Useful for testing. The data is destroyed when the log is dropped.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init()?;
        Ok(log)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            "
            -- Events table: the append-only source of truth
            -- ts_event: when the fact occurred
            -- ts_ingest: when it was recorded; replay order
            -- payload: JSON body keyed by event_type
            CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                ts_event TEXT NOT NULL,
                ts_ingest TEXT NOT NULL,
                origin_kind TEXT NOT NULL,
                origin_id TEXT NOT NULL,
                writer_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                identity_id TEXT NOT NULL,
                workload_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                causation_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                epoch INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_events_ts_ingest ON events(ts_ingest);
            CREATE INDEX IF NOT EXISTS idx_events_ts_event ON events(ts_event);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
            CREATE INDEX IF NOT EXISTS idx_events_identity ON events(identity_id);
            CREATE INDEX IF NOT EXISTS idx_events_scope ON events(scope_id);
            CREATE INDEX IF NOT EXISTS idx_events_correlation ON events(correlation_id);

            -- Background worker cursors
            CREATE TABLE IF NOT EXISTS system_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Usage rollups; total_usage is max_usage - min_usage
            CREATE TABLE IF NOT EXISTS usage_hourly (
                bucket_ts TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                pool_id TEXT NOT NULL,
                identity_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                total_usage INTEGER NOT NULL DEFAULT 0,
                min_usage INTEGER NOT NULL DEFAULT 0,
                max_usage INTEGER NOT NULL DEFAULT 0,
                event_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (bucket_ts, provider_id, pool_id, identity_id, scope_id)
            );

            CREATE TABLE IF NOT EXISTS usage_daily (
                bucket_ts TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                pool_id TEXT NOT NULL,
                identity_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                total_usage INTEGER NOT NULL DEFAULT 0,
                min_usage INTEGER NOT NULL DEFAULT 0,
                max_usage INTEGER NOT NULL DEFAULT 0,
                event_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (bucket_ts, provider_id, pool_id, identity_id, scope_id)
            );

            CREATE INDEX IF NOT EXISTS idx_usage_hourly_time ON usage_hourly(bucket_ts);
            CREATE INDEX IF NOT EXISTS idx_usage_daily_time ON usage_daily(bucket_ts);

            -- Projection checkpoints
            -- A snapshot disappears with its boundary event, so the newest
            -- snapshot always points at a live row.
            CREATE TABLE IF NOT EXISTS snapshots (
                snapshot_id TEXT PRIMARY KEY,
                schema_version INTEGER NOT NULL DEFAULT 1,
                ts_snapshot TEXT NOT NULL,
                last_event_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                FOREIGN KEY (last_event_id) REFERENCES events(event_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON snapshots(ts_snapshot DESC);

            -- Leader leases, owned by the external lease store
            CREATE TABLE IF NOT EXISTS leases (
                name TEXT PRIMARY KEY,
                holder_id TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                epoch INTEGER NOT NULL DEFAULT 0
            );
            ",
        )?;
        Ok(())
    }

    /// Appends one event.
    ///
    /// Fails with [`ValidationError`] when a mandatory field is empty or the
    /// id already exists.
    pub fn append(&self, event: &Event) -> Result<(), DbError> {
        self.append_all(std::slice::from_ref(event))
    }

    /// Appends a batch atomically: either every event lands or none does.
    pub fn append_all(&self, events: &[Event]) -> Result<(), DbError> {
        if events.is_empty() {
            return Ok(());
        }
        for event in events {
            event.validate()?;
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO events ({EVENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ))?;
            for event in events {
                let payload = serde_json::to_string(&event.payload)?;
                let result = stmt.execute(params![
                    event.event_id.as_str(),
                    event.event_type.as_str(),
                    i64::from(event.schema_version),
                    format_timestamp(event.ts_event),
                    format_timestamp(event.ts_ingest),
                    event.source.origin_kind,
                    event.source.origin_id,
                    event.source.writer_id,
                    event.dimensions.agent_id,
                    event.dimensions.identity_id,
                    event.dimensions.workload_id,
                    event.dimensions.scope_id,
                    event.correlation.correlation_id,
                    event.correlation.causation_id,
                    payload,
                    event.epoch,
                ]);
                match result {
                    Ok(_) => {}
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                    {
                        return Err(ValidationError::DuplicateEventId {
                            id: event.event_id.to_string(),
                        }
                        .into());
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Events ingested strictly after `since` (all events when `None`),
    /// oldest first.
    pub fn read_events(&self, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<Event>, DbError> {
        let since = since.map(format_timestamp).unwrap_or_default();
        let conn = self.conn();
        query_events(
            &conn,
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE ts_ingest > ?1
                 ORDER BY ts_ingest ASC, rowid ASC
                 LIMIT ?2"
            ),
            params![since, sql_limit(limit)],
        )
    }

    /// The most recent `limit` events, newest first.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<Event>, DbError> {
        let conn = self.conn();
        query_events(
            &conn,
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 ORDER BY ts_ingest DESC, rowid DESC
                 LIMIT ?1"
            ),
            params![sql_limit(limit)],
        )
    }

    /// Events matching every set field of `filter`, ordered by `ts_event`.
    pub fn query(&self, filter: &EventFilter) -> Result<Vec<Event>, DbError> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1=1");
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(from) = filter.from {
            sql.push_str(" AND ts_event >= ?");
            args.push(SqlValue::Text(format_timestamp(from)));
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND ts_event < ?");
            args.push(SqlValue::Text(format_timestamp(to)));
        }
        if !filter.event_types.is_empty() {
            sql.push_str(&format!(
                " AND event_type IN ({})",
                placeholders(filter.event_types.len())
            ));
            args.extend(
                filter
                    .event_types
                    .iter()
                    .map(|t| SqlValue::Text(t.as_str().to_string())),
            );
        }
        if let Some(identity_id) = &filter.identity_id {
            sql.push_str(" AND identity_id = ?");
            args.push(SqlValue::Text(identity_id.clone()));
        }
        if let Some(scope_id) = &filter.scope_id {
            sql.push_str(" AND scope_id = ?");
            args.push(SqlValue::Text(scope_id.clone()));
        }

        sql.push_str(" ORDER BY ts_event ASC, ts_ingest ASC, rowid ASC LIMIT ?");
        args.push(SqlValue::Integer(sql_limit(
            filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT),
        )));

        let conn = self.conn();
        query_events(&conn, &sql, params_from_iter(args))
    }

    /// Point lookup. A missing event is `Ok(None)`, not an error.
    pub fn get_event(&self, event_id: &str) -> Result<Option<Event>, DbError> {
        let conn = self.conn();
        get_event(&conn, event_id)
    }

    /// Events ingested strictly before `before`, oldest first. Feeds archival.
    pub fn read_candidate_events(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<Event>, DbError> {
        let conn = self.conn();
        query_events(
            &conn,
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE ts_ingest < ?1
                 ORDER BY ts_ingest ASC, rowid ASC
                 LIMIT ?2"
            ),
            params![format_timestamp(before), sql_limit(limit)],
        )
    }

    /// The ingest time of the newest event, if any.
    pub fn latest_ingest_time(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn();
        let latest: Option<String> =
            conn.query_row("SELECT MAX(ts_ingest) FROM events", [], |row| row.get(0))?;
        latest
            .map(|ts| parse_timestamp(&ts, "events.max_ts_ingest"))
            .transpose()
    }

    /// Clamps `requested` to the newest snapshot's boundary.
    ///
    /// Fails with [`DbError::NoSnapshot`] when no snapshot exists.
    pub fn safe_cutoff(&self, requested: DateTime<Utc>) -> Result<DateTime<Utc>, DbError> {
        let conn = self.conn();
        safe_cutoff(&conn, requested)
    }

    /// Deletes the given events, skipping any at or after the snapshot
    /// boundary. Returns the number of rows removed.
    pub fn delete_events(&self, event_ids: &[EventId]) -> Result<usize, DbError> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let boundary = boundary(&conn)?.ok_or(DbError::NoSnapshot)?;
        let boundary_ts = format_timestamp(boundary.ts_ingest);

        let tx = conn.transaction()?;
        let mut deleted = 0;
        for chunk in event_ids.chunks(DELETE_CHUNK) {
            let sql = format!(
                "DELETE FROM events WHERE ts_ingest < ? AND event_id IN ({})",
                placeholders(chunk.len())
            );
            let args = std::iter::once(boundary_ts.as_str()).chain(chunk.iter().map(EventId::as_str));
            deleted += tx.execute(&sql, params_from_iter(args))?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Deletes events older than `now - retention`, never reaching the
    /// newest snapshot's boundary. Returns the number of rows removed.
    pub fn prune_events(
        &self,
        retention: TimeDelta,
        now: DateTime<Utc>,
        types: &TypeFilter,
    ) -> Result<usize, DbError> {
        let conn = self.conn();
        let cutoff = safe_cutoff(&conn, now - retention)?;

        let mut sql = String::from("DELETE FROM events WHERE ts_ingest < ?");
        let mut args = vec![SqlValue::Text(format_timestamp(cutoff))];
        match types {
            TypeFilter::All => {}
            TypeFilter::Only(event_type) => {
                sql.push_str(" AND event_type = ?");
                args.push(SqlValue::Text(event_type.as_str().to_string()));
            }
            TypeFilter::Except(excluded) if excluded.is_empty() => {}
            TypeFilter::Except(excluded) => {
                sql.push_str(&format!(
                    " AND event_type NOT IN ({})",
                    placeholders(excluded.len())
                ));
                args.extend(excluded.iter().map(|t| SqlValue::Text(t.as_str().to_string())));
            }
        }

        let deleted = conn.execute(&sql, params_from_iter(args))?;
        tracing::debug!(deleted, cutoff = %format_timestamp(cutoff), "pruned events");
        Ok(deleted)
    }

    /// Persists a snapshot. Its boundary event must exist.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DbError> {
        let conn = self.conn();
        if get_event(&conn, snapshot.last_event_id.as_str())?.is_none() {
            return Err(DbError::NotFound {
                key: snapshot.last_event_id.to_string(),
            });
        }
        conn.execute(
            "INSERT INTO snapshots (snapshot_id, schema_version, ts_snapshot, last_event_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.snapshot_id.as_str(),
                i64::from(snapshot.schema_version),
                format_timestamp(snapshot.ts_snapshot),
                snapshot.last_event_id.as_str(),
                serde_json::to_string(&snapshot.payload)?,
            ],
        )?;
        Ok(())
    }

    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>, DbError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT snapshot_id, schema_version, ts_snapshot, last_event_id, payload
                 FROM snapshots
                 ORDER BY ts_snapshot DESC, rowid DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((snapshot_id, schema_version, ts_snapshot, last_event_id, payload)) = row else {
            return Ok(None);
        };
        let ts_snapshot = parse_timestamp(&ts_snapshot, &snapshot_id)?;
        let schema_version = u32::try_from(schema_version).map_err(|_| DbError::InvalidEventData {
            event_id: snapshot_id.clone(),
            message: format!("schema version {schema_version} out of range"),
        })?;
        Ok(Some(Snapshot {
            snapshot_id: SnapshotId::new(snapshot_id)?,
            schema_version,
            ts_snapshot,
            last_event_id: EventId::new(last_event_id)?,
            payload: serde_json::from_str(&payload)?,
        }))
    }

    /// The newest snapshot together with its boundary event's ingest time.
    pub fn snapshot_boundary(&self) -> Result<Option<SnapshotBoundary>, DbError> {
        let conn = self.conn();
        boundary(&conn)
    }

    pub fn snapshot_count(&self) -> Result<i64, DbError> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?)
    }

    /// Reads a worker cursor. A missing key is [`DbError::NotFound`].
    pub fn get_system_state(&self, key: &str) -> Result<String, DbError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT value FROM system_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| DbError::NotFound {
            key: key.to_string(),
        })
    }

    pub fn set_system_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        put_system_state(&self.conn(), key, value)
    }

    /// Merges rollup rows into the `bucket` table.
    ///
    /// Each stat's `bucket_ts` must already be truncated with
    /// [`Bucket::truncate`].
    pub fn upsert_usage_stats(&self, bucket: Bucket, stats: &[UsageStat]) -> Result<usize, DbError> {
        if stats.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let written = upsert_stats(&tx, bucket, stats)?;
        tx.commit()?;
        Ok(written)
    }

    /// Merges rollup rows for several buckets and moves the worker's cursor
    /// in one transaction, so a crash never counts a batch twice.
    pub fn commit_rollup(
        &self,
        batches: &[(Bucket, Vec<UsageStat>)],
        cursor_key: &str,
        cursor_value: &str,
    ) -> Result<usize, DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut written = 0;
        for (bucket, stats) in batches {
            written += upsert_stats(&tx, *bucket, stats)?;
        }
        put_system_state(&tx, cursor_key, cursor_value)?;
        tx.commit()?;
        Ok(written)
    }

    pub fn usage_stats(&self, filter: &UsageFilter) -> Result<Vec<UsageStat>, DbError> {
        let mut sql = format!(
            "SELECT bucket_ts, provider_id, pool_id, identity_id, scope_id,
                    total_usage, min_usage, max_usage, event_count
             FROM {}
             WHERE bucket_ts >= ? AND bucket_ts < ?",
            filter.bucket.table()
        );
        let mut args = vec![format_timestamp(filter.from), format_timestamp(filter.to)];
        let optional = [
            ("provider_id", &filter.provider_id),
            ("pool_id", &filter.pool_id),
            ("identity_id", &filter.identity_id),
            ("scope_id", &filter.scope_id),
        ];
        for (column, value) in optional {
            if let Some(value) = value {
                sql.push_str(&format!(" AND {column} = ?"));
                args.push(value.clone());
            }
        }
        sql.push_str(" ORDER BY bucket_ts ASC, provider_id ASC, pool_id ASC");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok((
                row.get::<_, String>(0)?,
                UsageStat {
                    bucket_ts: DateTime::<Utc>::MIN_UTC,
                    provider_id: row.get(1)?,
                    pool_id: row.get(2)?,
                    identity_id: row.get(3)?,
                    scope_id: row.get(4)?,
                    total_usage: row.get(5)?,
                    min_usage: row.get(6)?,
                    max_usage: row.get(7)?,
                    event_count: row.get(8)?,
                },
            ))
        })?;
        let mut stats = Vec::new();
        for row in rows {
            let (bucket_ts, mut stat) = row?;
            stat.bucket_ts = parse_timestamp(&bucket_ts, filter.bucket.table())?;
            stats.push(stat);
        }
        Ok(stats)
    }

    pub fn event_count(&self) -> Result<i64, DbError> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
    }

    /// Lists the last ingest timestamp per event type, ordered by most recent.
    pub fn last_event_times_by_type(&self) -> Result<Vec<TypeLastEvent>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "
            SELECT event_type, MAX(ts_ingest) AS last_ingest, COUNT(*)
            FROM events
            GROUP BY event_type
            ORDER BY last_ingest DESC, event_type ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TypeLastEvent {
                event_type: row.get(0)?,
                last_ingest: row.get(1)?,
                count: row.get(2)?,
            })
        })?;
        let mut types = Vec::new();
        for row in rows {
            types.push(row?);
        }
        Ok(types)
    }
}

pub fn put_system_state(conn: &Connection, key: &str, value: &str) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO system_state (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (key) DO UPDATE SET
             value = excluded.value,
             updated_at = excluded.updated_at",
        params![key, value, format_timestamp(Utc::now())],
    )?;
    Ok(())
}

fn upsert_stats(conn: &Connection, bucket: Bucket, stats: &[UsageStat]) -> Result<usize, DbError> {
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {table} (
             bucket_ts, provider_id, pool_id, identity_id, scope_id,
             total_usage, min_usage, max_usage, event_count
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (bucket_ts, provider_id, pool_id, identity_id, scope_id)
         DO UPDATE SET
             total_usage = MAX(max_usage, excluded.max_usage) - MIN(min_usage, excluded.min_usage),
             min_usage = MIN(min_usage, excluded.min_usage),
             max_usage = MAX(max_usage, excluded.max_usage),
             event_count = event_count + excluded.event_count",
        table = bucket.table()
    ))?;
    let mut written = 0;
    for stat in stats {
        written += stmt.execute(params![
            format_timestamp(stat.bucket_ts),
            stat.provider_id,
            stat.pool_id,
            stat.identity_id,
            stat.scope_id,
            stat.total_usage,
            stat.min_usage,
            stat.max_usage,
            stat.event_count,
        ])?;
    }
    Ok(written)
}

/// Raw column values of one `events` row.
struct EventRow {
    event_id: String,
    event_type: String,
    schema_version: i64,
    ts_event: String,
    ts_ingest: String,
    origin_kind: String,
    origin_id: String,
    writer_id: String,
    agent_id: String,
    identity_id: String,
    workload_id: String,
    scope_id: String,
    correlation_id: String,
    causation_id: String,
    payload: String,
    epoch: i64,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            event_type: row.get(1)?,
            schema_version: row.get(2)?,
            ts_event: row.get(3)?,
            ts_ingest: row.get(4)?,
            origin_kind: row.get(5)?,
            origin_id: row.get(6)?,
            writer_id: row.get(7)?,
            agent_id: row.get(8)?,
            identity_id: row.get(9)?,
            workload_id: row.get(10)?,
            scope_id: row.get(11)?,
            correlation_id: row.get(12)?,
            causation_id: row.get(13)?,
            payload: row.get(14)?,
            epoch: row.get(15)?,
        })
    }

    fn into_event(self) -> Result<Event, DbError> {
        let invalid = |message: String| DbError::InvalidEventData {
            event_id: self.event_id.clone(),
            message,
        };
        let event_type: EventType = self
            .event_type
            .parse()
            .map_err(|e: ql_core::UnknownEventType| invalid(e.to_string()))?;
        let schema_version = u32::try_from(self.schema_version)
            .map_err(|_| invalid(format!("schema version {} out of range", self.schema_version)))?;
        let payload: Value = serde_json::from_str(&self.payload)
            .map_err(|e| invalid(format!("payload is not JSON: {e}")))?;
        let ts_event = parse_timestamp(&self.ts_event, &self.event_id)?;
        let ts_ingest = parse_timestamp(&self.ts_ingest, &self.event_id)?;

        Ok(Event {
            event_id: EventId::new(self.event_id)?,
            event_type,
            schema_version,
            ts_event,
            ts_ingest,
            epoch: self.epoch,
            source: Source {
                origin_kind: self.origin_kind,
                origin_id: self.origin_id,
                writer_id: self.writer_id,
            },
            dimensions: Dimensions {
                agent_id: self.agent_id,
                identity_id: self.identity_id,
                workload_id: self.workload_id,
                scope_id: self.scope_id,
            },
            correlation: Correlation {
                correlation_id: self.correlation_id,
                causation_id: self.causation_id,
            },
            payload,
        })
    }
}

fn query_events<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Event>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, EventRow::from_row)?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row?.into_event()?);
    }
    Ok(events)
}

fn get_event(conn: &Connection, event_id: &str) -> Result<Option<Event>, DbError> {
    let row = conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"),
            [event_id],
            EventRow::from_row,
        )
        .optional()?;
    row.map(EventRow::into_event).transpose()
}

fn boundary(conn: &Connection) -> Result<Option<SnapshotBoundary>, DbError> {
    let row = conn
        .query_row(
            "SELECT s.snapshot_id, s.last_event_id, s.ts_snapshot, e.ts_ingest
             FROM snapshots s
             JOIN events e ON e.event_id = s.last_event_id
             ORDER BY s.ts_snapshot DESC, s.rowid DESC
             LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((snapshot_id, last_event_id, ts_snapshot, ts_ingest)) = row else {
        return Ok(None);
    };
    Ok(Some(SnapshotBoundary {
        ts_snapshot: parse_timestamp(&ts_snapshot, &snapshot_id)?,
        ts_ingest: parse_timestamp(&ts_ingest, &last_event_id)?,
        snapshot_id: SnapshotId::new(snapshot_id)?,
        last_event_id: EventId::new(last_event_id)?,
    }))
}

fn safe_cutoff(conn: &Connection, requested: DateTime<Utc>) -> Result<DateTime<Utc>, DbError> {
    let boundary = boundary(conn)?.ok_or(DbError::NoSnapshot)?;
    Ok(requested.min(boundary.ts_ingest))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Parses a stored timestamp; `id` names the row or key for the error.
pub fn parse_timestamp(timestamp: &str, id: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            id: id.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

/// Formats a timestamp the way every column in the log stores it.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}
