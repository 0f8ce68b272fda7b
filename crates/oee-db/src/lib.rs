//! Storage layer for the OEE engine.
//!
//! Holds the append-only event store, the master data, the materialized
//! rollup tables and the refresh queue in one SQLite database.
//!
//! # Concurrency
//!
//! [`Database`] wraps a `rusqlite::Connection`, which is `Send` but not
//! `Sync`. Every refresh worker opens its own connection to the same file;
//! the database runs in WAL mode with a busy timeout so readers never block
//! the ingest writer and short write transactions queue instead of failing.
//! Claims on refresh windows use `BEGIN IMMEDIATE` transactions so two
//! connections can never lease the same window.
//!
//! # Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 with millisecond precision and a
//! `Z` suffix (e.g. `2025-03-03T06:00:00.000Z`). Every value is written by
//! [`format_timestamp`], so lexicographic order matches chronological order.
//!
//! # Change feed
//!
//! Every append, close and invalidation is published as a [`StoreChange`] on
//! a broadcast channel. Sending never blocks and is skipped when nobody
//! listens.

mod ingest;
mod master;
mod queue;
mod rollup;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, SecondsFormat, Utc};
use oee_core::{
    EquipmentId, ErrorKind, Granularity, MasterDataError, TimeWindow, ValidationError,
};
use rusqlite::{Connection, Row, types::Type};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

pub use ingest::IngestReceipt;
pub use master::MasterSummary;
pub use queue::{
    ClaimedWindow, FailOutcome, FailingWindow, QueueCount, RefreshStatus, RetryPolicy, WatermarkRow,
    WindowKey, WindowStatus,
};
pub use rollup::QueryResult;

const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);
const CHANGE_FEED_CAPACITY: usize = 1024;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An event or record failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// Master data failed validation.
    #[error(transparent)]
    MasterData(#[from] MasterDataError),

    /// An event referenced equipment without master data.
    #[error("unknown equipment {0}")]
    UnknownEquipment(String),

    /// A close arrived while no interval was open.
    #[error("no open state to close for equipment {equipment}")]
    NoOpenState { equipment: String },

    /// A state interval starts before or inside an interval already stored.
    #[error("state for equipment {equipment} at {start} overlaps stored interval starting {existing}")]
    StateOverlap {
        equipment: String,
        start: DateTime<Utc>,
        existing: DateTime<Utc>,
    },
}

impl DbError {
    /// Taxonomy bucket for this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Sqlite(
                rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::InvalidColumnType(..),
            )
            | Self::Invalid(_)
            | Self::MasterData(_)
            | Self::UnknownEquipment(_) => ErrorKind::Configuration,
            Self::Sqlite(_) => ErrorKind::TransientStore,
            Self::NoOpenState { .. } | Self::StateOverlap { .. } => ErrorKind::OutOfOrder,
        }
    }
}

/// A change published by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum StoreChange {
    StateOpened {
        equipment_id: EquipmentId,
        at: DateTime<Utc>,
    },
    StateClosed {
        equipment_id: EquipmentId,
        at: DateTime<Utc>,
    },
    CountAppended {
        equipment_id: EquipmentId,
        at: DateTime<Utc>,
    },
    QualityAppended {
        equipment_id: EquipmentId,
        at: DateTime<Utc>,
    },
    Invalidated {
        equipment_id: EquipmentId,
        window: TimeWindow,
        windows: usize,
    },
    MasterDataLoaded,
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for concurrency considerations.
pub struct Database {
    conn: Connection,
    changes: broadcast::Sender<StoreChange>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let db = Self { conn, changes };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS equipment (
                id TEXT PRIMARY KEY,
                site_id TEXT,
                ideal_cycle_time_secs REAL NOT NULL,
                startup_window_secs INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reason_codes (
                code TEXT PRIMARY KEY,
                loss_category TEXT NOT NULL,
                downtime TEXT NOT NULL,
                description TEXT
            );

            -- scope: equipment id or site id
            CREATE TABLE IF NOT EXISTS shift_instances (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                date TEXT NOT NULL,
                planned_start TEXT NOT NULL,
                planned_end TEXT NOT NULL,
                planned_minutes INTEGER NOT NULL,
                break_minutes INTEGER NOT NULL DEFAULT 0,
                break_start TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_shifts_scope ON shift_instances(scope, planned_start);

            -- end_time is NULL while the interval is open
            CREATE TABLE IF NOT EXISTS equipment_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                equipment_id TEXT NOT NULL,
                category TEXT NOT NULL,
                reason_code TEXT,
                start_time TEXT NOT NULL,
                end_time TEXT,
                shift_id TEXT NOT NULL,
                ingested_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_states_equipment ON equipment_states(equipment_id, start_time);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_states_one_open
                ON equipment_states(equipment_id) WHERE end_time IS NULL;

            CREATE TABLE IF NOT EXISTS production_counts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                equipment_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                total_count INTEGER NOT NULL,
                good_count INTEGER NOT NULL,
                reject_count INTEGER NOT NULL DEFAULT 0,
                rework_count INTEGER NOT NULL DEFAULT 0,
                shift_id TEXT NOT NULL,
                ingested_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_counts_equipment ON production_counts(equipment_id, timestamp);

            CREATE TABLE IF NOT EXISTS quality_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                equipment_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                defect_category TEXT NOT NULL,
                defect_count INTEGER NOT NULL,
                severity TEXT NOT NULL,
                ingested_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_quality_equipment ON quality_events(equipment_id, timestamp);

            -- Additive numerators only; rates are derived on read.
            CREATE TABLE IF NOT EXISTS oee_rollups (
                equipment_id TEXT NOT NULL,
                granularity TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                planned_time_ms INTEGER NOT NULL,
                operating_time_ms INTEGER NOT NULL,
                theoretical_output REAL NOT NULL,
                actual_output INTEGER NOT NULL,
                good_count INTEGER NOT NULL,
                reject_count INTEGER NOT NULL,
                rework_count INTEGER NOT NULL,
                defect_events INTEGER NOT NULL,
                breakdown_ms INTEGER NOT NULL,
                setup_ms INTEGER NOT NULL,
                minor_stop_ms INTEGER NOT NULL,
                startup_defect_units INTEGER NOT NULL,
                production_defect_units INTEGER NOT NULL,
                sample_count INTEGER NOT NULL,
                low_confidence INTEGER NOT NULL,
                computed_at TEXT NOT NULL,
                PRIMARY KEY (equipment_id, window_start, granularity)
            );

            CREATE TABLE IF NOT EXISTS reliability_records (
                equipment_id TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                failure_count INTEGER NOT NULL,
                total_downtime_ms INTEGER NOT NULL,
                computed_at TEXT NOT NULL,
                PRIMARY KEY (equipment_id, period_start, period_end)
            );

            -- status: PENDING, IN_PROGRESS or DONE
            -- level: granularity rank, finest first
            CREATE TABLE IF NOT EXISTS refresh_windows (
                equipment_id TEXT NOT NULL,
                granularity TEXT NOT NULL,
                level INTEGER NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT,
                last_error TEXT,
                error_kind TEXT,
                lease_owner TEXT,
                lease_expires_at TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (equipment_id, granularity, window_start)
            );

            CREATE INDEX IF NOT EXISTS idx_refresh_status ON refresh_windows(status, level, window_start);

            CREATE TABLE IF NOT EXISTS watermarks (
                equipment_id TEXT NOT NULL,
                granularity TEXT NOT NULL,
                watermark TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (equipment_id, granularity)
            );
            ",
        )?;
        Ok(())
    }

    /// Subscribes to the change feed of this connection.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Publishes this connection's changes on an existing feed instead of its
    /// own, so several connections share one stream of changes.
    pub fn attach_change_feed(&mut self, feed: broadcast::Sender<StoreChange>) {
        self.changes = feed;
    }

    /// The sender side of this connection's change feed.
    pub fn change_feed(&self) -> broadcast::Sender<StoreChange> {
        self.changes.clone()
    }

    fn publish(&self, change: StoreChange) {
        if self.changes.receiver_count() > 0 {
            // Fails only when every receiver was dropped in between.
            let _ = self.changes.send(change);
        }
    }
}

/// Formats a timestamp the way every column stores it.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|parsed| parsed.with_timezone(&Utc))
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Reads a timestamp column.
fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_timestamp(&value).map_err(|err| conversion_error(idx, err))
}

/// Reads a nullable timestamp column.
fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| parse_timestamp(&v).map_err(|err| conversion_error(idx, err)))
        .transpose()
}

/// Reads a column stored via `as_str` and parsed back with `FromStr`.
fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value: String = row.get(idx)?;
    value.parse().map_err(|err| conversion_error(idx, err))
}

/// Reads a validated string ID column.
fn id_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: TryFrom<String, Error = ValidationError>,
{
    let value: String = row.get(idx)?;
    T::try_from(value).map_err(|err| conversion_error(idx, err))
}

/// Rank used to order refresh work finest first.
const fn level_rank(granularity: Granularity) -> i64 {
    match granularity {
        Granularity::Raw => 0,
        Granularity::Minute => 1,
        Granularity::FiveMinute => 2,
        Granularity::Hour => 3,
        Granularity::Day => 4,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use oee_core::{
        DowntimeClass, EquipmentId, EquipmentSpec, LossCategory, MasterData, ReasonCode,
        ReasonCodeEntry, ShiftId, ShiftInstance,
    };

    use crate::Database;

    pub fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 6, 0, 0)
            .single()
            .expect("valid test timestamp")
            + Duration::minutes(minutes)
    }

    pub fn press() -> EquipmentId {
        EquipmentId::new("press-01").unwrap()
    }

    pub fn master_data() -> MasterData {
        let entry = |code: &str, loss, downtime| ReasonCodeEntry {
            code: ReasonCode::new(code).unwrap(),
            loss_category: loss,
            downtime,
            description: None,
        };
        MasterData {
            equipment: vec![EquipmentSpec {
                id: press(),
                site_id: Some("plant-a".to_string()),
                ideal_cycle_time_secs: 60.0,
                startup_window_secs: 600,
            }],
            reason_codes: vec![
                entry("JAM", LossCategory::Breakdown, DowntimeClass::Unplanned),
                entry("CHANGEOVER", LossCategory::Setup, DowntimeClass::Planned),
            ],
            shifts: vec![ShiftInstance {
                id: ShiftId::new("day-1").unwrap(),
                scope: "plant-a".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
                planned_start: ts(0),
                planned_end: ts(480),
                planned_minutes: 480,
                break_minutes: 30,
                break_start: None,
            }],
        }
    }

    pub fn seeded_db() -> Database {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        db.load_master_data(&master_data()).expect("load master data");
        db
    }
}
