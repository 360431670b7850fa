//! SQLite event store for tally.
//!
//! Watcher samples land here through `tally import` and are replayed by the
//! accumulation engine through the [`EventSource`] implementation.
//!
//! # Thread Safety
//!
//! The [`EventStore`] type wraps a `rusqlite::Connection`, which is `Send` but
//! not `Sync`. This means an `EventStore` instance can be moved between threads
//! but cannot be shared across threads without external synchronization.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in ISO 8601 UTC with millisecond precision
//! (e.g., `2024-01-15T10:30:00.000Z`). Incoming timestamps are normalized to
//! this form on insert, so lexicographic ordering matches chronological
//! ordering no matter which offset a watcher reported in.
//!
//! ## Range Queries
//!
//! Events carry a duration, so a range query has to match events that overlap
//! the range, not just those that start inside it. The `end_ts` column holds
//! the precomputed event end for exactly that query; it is derived on insert
//! and never written by callers.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::{Connection, params};
use thiserror::Error;

use tally_core::{Event, EventId, EventKind, EventSource, SourceError, SourceId};

/// Event store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse an event timestamp.
    #[error("invalid timestamp for event {event_id}: {timestamp}")]
    TimestampParse {
        event_id: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A record fails validation on the way in or out of the store.
    #[error("invalid record {event_id}: {message}")]
    InvalidRecord { event_id: String, message: String },
}

// Sqlite failures may clear up on retry; everything else is bad data.
impl From<StoreError> for SourceError {
    fn from(error: StoreError) -> Self {
        match &error {
            StoreError::Sqlite(_) => Self::Unavailable(error.to_string()),
            StoreError::TimestampParse { .. } | StoreError::InvalidRecord { .. } => {
                Self::Malformed(error.to_string())
            }
        }
    }
}

/// Event store connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct EventStore {
    conn: Connection,
}

/// A raw event row as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: String,
    pub timestamp: String,
    pub duration_ms: i64,
    pub kind: String,
    pub source: String,
    pub payload: String,
}

impl EventRecord {
    /// Builds a record from a typed event.
    pub fn from_event(event: &Event) -> Self {
        Self {
            id: event.id.as_str().to_string(),
            timestamp: format_timestamp(event.timestamp),
            duration_ms: event.duration.num_milliseconds(),
            kind: event.kind.to_string(),
            source: event.source.as_str().to_string(),
            payload: event.payload.to_string(),
        }
    }

    /// Converts the record back into a typed event.
    pub fn into_event(self) -> Result<Event, StoreError> {
        let timestamp = parse_timestamp(&self.timestamp, &self.id)?;
        if self.duration_ms < 0 {
            return Err(StoreError::InvalidRecord {
                event_id: self.id,
                message: format!("negative duration_ms: {}", self.duration_ms),
            });
        }
        let kind = self
            .kind
            .parse::<EventKind>()
            .map_err(|err| StoreError::InvalidRecord {
                event_id: self.id.clone(),
                message: err.to_string(),
            })?;
        let payload =
            serde_json::from_str(&self.payload).map_err(|err| StoreError::InvalidRecord {
                event_id: self.id.clone(),
                message: format!("payload is not valid JSON: {err}"),
            })?;
        let source = SourceId::new(self.source).map_err(|err| StoreError::InvalidRecord {
            event_id: self.id.clone(),
            message: err.to_string(),
        })?;
        let id = EventId::new(self.id.clone()).map_err(|err| StoreError::InvalidRecord {
            event_id: self.id,
            message: err.to_string(),
        })?;
        Ok(Event {
            id,
            timestamp,
            duration: TimeDelta::milliseconds(self.duration_ms),
            kind,
            source,
            payload,
        })
    }
}

/// Latest event timestamp grouped by source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFreshness {
    pub source: String,
    pub last_event: String,
}

impl EventStore {
    /// Opens a store at the given path, creating it if necessary.
    ///
    /// The schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Opens an in-memory store.
    ///
    /// Useful for testing. The store is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized store.
    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            -- Events table: stores raw watcher samples
            -- timestamp/end_ts: ISO 8601 UTC (e.g., '2024-01-15T10:30:00.000Z')
            -- end_ts: timestamp + duration, derived on insert for range queries
            -- payload: watcher-specific JSON, stored verbatim
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                end_ts TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_kind_timestamp ON events(kind, timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_source ON events(source);
            ",
        )?;
        Ok(())
    }

    /// Inserts a batch of events, ignoring duplicates by ID.
    ///
    /// Timestamps are normalized to UTC with millisecond precision on the way
    /// in, and the event end is precomputed into `end_ts`. Returns the number
    /// of rows actually inserted. A malformed record aborts the whole batch.
    pub fn insert_events(&mut self, events: &[EventRecord]) -> Result<usize, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO events
                (id, timestamp, end_ts, duration_ms, kind, source, payload)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for event in events {
                let start = parse_timestamp(&event.timestamp, &event.id)?;
                if event.duration_ms < 0 {
                    return Err(StoreError::InvalidRecord {
                        event_id: event.id.clone(),
                        message: format!("negative duration_ms: {}", event.duration_ms),
                    });
                }
                let end = start
                    .checked_add_signed(TimeDelta::milliseconds(event.duration_ms))
                    .ok_or_else(|| StoreError::InvalidRecord {
                        event_id: event.id.clone(),
                        message: format!("duration_ms out of range: {}", event.duration_ms),
                    })?;
                inserted += stmt.execute(params![
                    event.id,
                    format_timestamp(start),
                    format_timestamp(end),
                    event.duration_ms,
                    event.kind,
                    event.source,
                    event.payload,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Lists events of one kind that overlap a time range.
    ///
    /// The range is inclusive of `start` and exclusive of `end`. An event
    /// matches when it covers any part of the range; a zero-duration event
    /// sitting exactly on `start` is included, one sitting on `end` is not.
    pub fn events_in_range(
        &self,
        kind: EventKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        if end <= start {
            return Ok(Vec::new());
        }
        let start = format_timestamp(start);
        let end = format_timestamp(end);
        let mut stmt = self.conn.prepare(
            "
            SELECT id, timestamp, duration_ms, kind, source, payload
            FROM events
            WHERE kind = ? AND timestamp < ? AND (end_ts > ? OR timestamp >= ?)
            ORDER BY timestamp ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map(params![kind.as_str(), end, start, start], |row| {
            Ok(EventRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                duration_ms: row.get(2)?,
                kind: row.get(3)?,
                source: row.get(4)?,
                payload: row.get(5)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Lists the last event timestamp per source, ordered by most recent.
    pub fn source_freshness(&self) -> Result<Vec<SourceFreshness>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT source, MAX(timestamp) AS last_event
            FROM events
            GROUP BY source
            ORDER BY last_event DESC, source ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SourceFreshness {
                source: row.get(0)?,
                last_event: row.get(1)?,
            })
        })?;
        let mut sources = Vec::new();
        for row in rows {
            sources.push(row?);
        }
        Ok(sources)
    }
}

impl EventSource for EventStore {
    fn list_events(
        &self,
        kind: EventKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, SourceError> {
        let records = self.events_in_range(kind, start, end)?;
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            events.push(record.into_event()?);
        }
        Ok(events)
    }
}

fn parse_timestamp(timestamp: &str, event_id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| StoreError::TimestampParse {
            event_id: event_id.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn open_in_memory_store() {
        let store = EventStore::open_in_memory();
        assert!(store.is_ok());
    }

    #[test]
    fn a_store_file_persists_across_connections() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("events.db");

        let mut store = EventStore::open(&path).expect("create store");
        let event = event_record(
            "event-1",
            "2024-03-01T10:00:00Z",
            60_000,
            "window",
            "window-watcher",
            r#"{"app":"editor"}"#,
        );
        store.insert_events(&[event]).expect("insert event");
        drop(store);

        let reopened = EventStore::open(&path).expect("reopen store");
        let events = reopened
            .events_in_range(
                EventKind::Window,
                utc("2024-03-01T10:00:00Z"),
                utc("2024-03-01T11:00:00Z"),
            )
            .expect("query reopened store");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "event-1");
    }

    #[test]
    fn schema_matches_data_model() {
        let store = EventStore::open_in_memory().expect("open in-memory store");

        let events_columns = table_columns(&store.conn, "events");
        assert_eq!(
            events_columns,
            vec![
                "id",
                "timestamp",
                "end_ts",
                "duration_ms",
                "kind",
                "source",
                "payload",
            ]
        );

        let event_indexes = index_names(&store.conn, "events");
        let expected_event_indexes: HashSet<String> = [
            "idx_events_timestamp",
            "idx_events_kind_timestamp",
            "idx_events_source",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert!(expected_event_indexes.is_subset(&event_indexes));
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    fn index_names(conn: &Connection, table: &str) -> HashSet<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({table})"))
            .expect("prepare index_list");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query index_list");
        rows.map(|row| row.expect("index_list row")).collect()
    }

    #[test]
    fn insert_events_is_idempotent() {
        let mut store = EventStore::open_in_memory().expect("open in-memory store");
        let event = event_record(
            "event-1",
            "2024-03-01T10:00:00Z",
            120_000,
            "window",
            "window-watcher",
            r#"{"app":"editor"}"#,
        );

        let inserted = store.insert_events(&[event.clone(), event]).unwrap();
        assert_eq!(inserted, 1);

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn insert_normalizes_offset_timestamps() {
        let mut store = EventStore::open_in_memory().expect("open in-memory store");
        let event = event_record(
            "event-1",
            "2024-03-01T12:00:00+02:00",
            1_000,
            "window",
            "window-watcher",
            r#"{"app":"editor"}"#,
        );

        store.insert_events(&[event]).expect("insert event");

        let (timestamp, end_ts): (String, String) = store
            .conn
            .query_row(
                "SELECT timestamp, end_ts FROM events WHERE id = ?",
                ["event-1"],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(timestamp, "2024-03-01T10:00:00.000Z");
        assert_eq!(end_ts, "2024-03-01T10:00:01.000Z");
    }

    #[test]
    fn a_bad_record_aborts_the_whole_batch() {
        let mut store = EventStore::open_in_memory().expect("open in-memory store");
        let good = event_record(
            "event-good",
            "2024-03-01T10:00:00Z",
            1_000,
            "window",
            "window-watcher",
            r#"{"app":"editor"}"#,
        );
        let bad = event_record(
            "event-bad",
            "2024-03-01T10:01:00Z",
            -1,
            "window",
            "window-watcher",
            r#"{"app":"editor"}"#,
        );

        let err = store.insert_events(&[good, bad]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn malformed_timestamps_are_rejected() {
        let mut store = EventStore::open_in_memory().expect("open in-memory store");
        let event = event_record(
            "event-1",
            "yesterday",
            0,
            "window",
            "window-watcher",
            r#"{"app":"editor"}"#,
        );

        let err = store.insert_events(&[event]).unwrap_err();
        assert!(matches!(err, StoreError::TimestampParse { .. }));
    }

    #[test]
    fn range_query_matches_overlap_not_containment() {
        let mut store = EventStore::open_in_memory().expect("open in-memory store");
        let events = vec![
            event_record(
                "event-before",
                "2024-03-01T09:00:00Z",
                600_000,
                "window",
                "window-watcher",
                r#"{"app":"editor"}"#,
            ),
            event_record(
                "event-straddles",
                "2024-03-01T09:55:00Z",
                600_000,
                "window",
                "window-watcher",
                r#"{"app":"editor"}"#,
            ),
            event_record(
                "event-at-start",
                "2024-03-01T10:00:00Z",
                0,
                "window",
                "window-watcher",
                r#"{"app":"editor"}"#,
            ),
            event_record(
                "event-inside",
                "2024-03-01T10:30:00Z",
                60_000,
                "window",
                "window-watcher",
                r#"{"app":"editor"}"#,
            ),
            event_record(
                "event-at-end",
                "2024-03-01T11:00:00Z",
                0,
                "window",
                "window-watcher",
                r#"{"app":"editor"}"#,
            ),
            event_record(
                "event-other-kind",
                "2024-03-01T10:15:00Z",
                60_000,
                "presence",
                "user-idle",
                r#"{"state":"away"}"#,
            ),
        ];
        store.insert_events(&events).expect("insert events");

        let matched = store
            .events_in_range(
                EventKind::Window,
                utc("2024-03-01T10:00:00Z"),
                utc("2024-03-01T11:00:00Z"),
            )
            .expect("query range");
        let ids: Vec<&str> = matched.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, vec!["event-straddles", "event-at-start", "event-inside"]);
    }

    #[test]
    fn an_empty_range_returns_nothing() {
        let mut store = EventStore::open_in_memory().expect("open in-memory store");
        let event = event_record(
            "event-1",
            "2024-03-01T10:00:00Z",
            60_000,
            "window",
            "window-watcher",
            r#"{"app":"editor"}"#,
        );
        store.insert_events(&[event]).expect("insert event");

        let at = utc("2024-03-01T10:00:00Z");
        assert!(store.events_in_range(EventKind::Window, at, at).unwrap().is_empty());
        assert!(
            store
                .events_in_range(EventKind::Window, at, at - TimeDelta::minutes(5))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn source_freshness_returns_latest_per_source() {
        let mut store = EventStore::open_in_memory().expect("open in-memory store");
        let events = vec![
            event_record(
                "event-w1",
                "2024-03-01T10:00:00Z",
                60_000,
                "window",
                "window-watcher",
                r#"{"app":"editor"}"#,
            ),
            event_record(
                "event-p1",
                "2024-03-01T10:02:00Z",
                60_000,
                "presence",
                "user-idle",
                r#"{"state":"active"}"#,
            ),
            event_record(
                "event-w2",
                "2024-03-01T10:03:00Z",
                60_000,
                "window",
                "window-watcher",
                r#"{"app":"editor"}"#,
            ),
        ];
        store.insert_events(&events).expect("insert events");

        let sources = store.source_freshness().expect("fetch freshness");
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].source, "window-watcher");
        assert_eq!(sources[0].last_event, "2024-03-01T10:03:00.000Z");
        assert_eq!(sources[1].source, "user-idle");
        assert_eq!(sources[1].last_event, "2024-03-01T10:02:00.000Z");
    }

    #[test]
    fn events_survive_the_record_round_trip() {
        let event = Event {
            id: EventId::new("event-1").unwrap(),
            timestamp: utc("2024-03-01T10:00:00Z"),
            duration: TimeDelta::minutes(2),
            kind: EventKind::Window,
            source: SourceId::new("window-watcher").unwrap(),
            payload: json!({"app": "editor", "title": "main.rs"}),
        };

        let record = EventRecord::from_event(&event);
        assert_eq!(record.timestamp, "2024-03-01T10:00:00.000Z");
        assert_eq!(record.duration_ms, 120_000);

        let restored = record.into_event().expect("restore event");
        assert_eq!(restored, event);
    }

    #[test]
    fn the_store_replays_typed_events() {
        let mut store = EventStore::open_in_memory().expect("open in-memory store");
        let event = event_record(
            "event-1",
            "2024-03-01T10:00:00Z",
            120_000,
            "window",
            "window-watcher",
            r#"{"app":"editor"}"#,
        );
        store.insert_events(&[event]).expect("insert event");

        let events = store
            .list_events(
                EventKind::Window,
                utc("2024-03-01T10:00:00Z"),
                utc("2024-03-01T11:00:00Z"),
            )
            .expect("replay events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_str(), "event-1");
        assert_eq!(events[0].kind, EventKind::Window);
        assert_eq!(events[0].duration, TimeDelta::minutes(2));
        assert_eq!(events[0].payload, json!({"app": "editor"}));
    }

    #[test]
    fn unreadable_rows_surface_as_malformed() {
        let mut store = EventStore::open_in_memory().expect("open in-memory store");
        let event = event_record(
            "event-1",
            "2024-03-01T10:00:00Z",
            0,
            "window",
            "window-watcher",
            "not-json",
        );
        store.insert_events(&[event]).expect("insert event");

        let err = store
            .list_events(
                EventKind::Window,
                utc("2024-03-01T10:00:00Z"),
                utc("2024-03-01T11:00:00Z"),
            )
            .unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    fn event_record(
        id: &str,
        timestamp: &str,
        duration_ms: i64,
        kind: &str,
        source: &str,
        payload: &str,
    ) -> EventRecord {
        EventRecord {
            id: id.to_string(),
            timestamp: timestamp.to_string(),
            duration_ms,
            kind: kind.to_string(),
            source: source.to_string(),
            payload: payload.to_string(),
        }
    }

    fn utc(timestamp: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(timestamp)
            .unwrap()
            .with_timezone(&Utc)
    }
}
