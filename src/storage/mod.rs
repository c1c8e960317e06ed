//! SQLite storage layer -- pools, schema, timestamp encoding.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use thiserror::Error;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// The two database files. Raw samples, anomalies and incidents share one;
/// rollup buckets live in the other so a long rollup merge never holds the
/// write lock that anomaly appends wait on.
#[derive(Clone)]
pub struct Storage {
    pub events: Pool,
    pub rollups: Pool,
}

impl Storage {
    pub fn open(events_path: &str, rollups_path: &str) -> Result<Self> {
        Ok(Self {
            events: open_pool(events_path)?,
            rollups: open_rollup_pool(rollups_path)?,
        })
    }
}

/// Open (or create) the events database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    open_with(path, schema::migrate)
}

/// Open (or create) the rollup database and return a connection pool.
pub fn open_rollup_pool(path: &str) -> Result<Pool> {
    open_with(path, schema::migrate_rollups)
}

fn open_with(path: &str, migrate: fn(&Connection) -> Result<()>) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data directory {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    migrate(&conn).with_context(|| format!("failed to migrate {}", path))?;

    Ok(pool)
}

/// Timestamps are stored as epoch milliseconds so range scans and bucket
/// arithmetic stay integer comparisons.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// A caller-supplied lookback that is negative or reaches past the
/// representable time range.
#[derive(Debug, Error)]
#[error("lookback of {amount} {unit} is out of range")]
pub struct LookbackError {
    pub amount: i64,
    pub unit: &'static str,
}

fn before(
    now: DateTime<Utc>,
    amount: i64,
    unit: &'static str,
    span: Option<Duration>,
) -> Result<DateTime<Utc>, LookbackError> {
    span.filter(|_| amount >= 0)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or(LookbackError { amount, unit })
}

/// `now` minus `hours`.
pub fn hours_before(now: DateTime<Utc>, hours: i64) -> Result<DateTime<Utc>, LookbackError> {
    before(now, hours, "hours", Duration::try_hours(hours))
}

/// `now` minus `minutes`.
pub fn minutes_before(now: DateTime<Utc>, minutes: i64) -> Result<DateTime<Utc>, LookbackError> {
    before(now, minutes, "minutes", Duration::try_minutes(minutes))
}

/// Map a stored text column back into a typed value, surfacing parse
/// failures as rusqlite conversion errors.
pub(crate) fn parse_column<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
pub(crate) fn test_pool() -> (tempfile::TempDir, Pool) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("pipewatch-test.db");
    let pool = open_pool(path.to_str().expect("utf-8 path")).expect("open pool");
    (dir, pool)
}

#[cfg(test)]
pub(crate) fn test_storage() -> (tempfile::TempDir, Storage) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let events = dir.path().join("pipewatch-test.db");
    let rollups = dir.path().join("pipewatch-test-rollups.db");
    let storage = Storage::open(
        events.to_str().expect("utf-8 path"),
        rollups.to_str().expect("utf-8 path"),
    )
    .expect("open storage");
    (dir, storage)
}
