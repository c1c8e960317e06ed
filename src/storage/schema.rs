//! Database schema and migrations.
//!
//! The events database holds raw samples, anomaly events and cascade
//! incidents; the rollup database holds rollup buckets.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

fn record_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Run all pending migrations on the events database.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_VERSION_TABLE)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metric_samples (
            id INTEGER PRIMARY KEY,
            ts_ms INTEGER NOT NULL,
            ingested_ms INTEGER NOT NULL,
            component TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT,
            host TEXT NOT NULL,
            cluster TEXT NOT NULL,
            environment TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS anomaly_events (
            id TEXT PRIMARY KEY,
            ts_ms INTEGER NOT NULL,
            component TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            host TEXT NOT NULL,
            value REAL NOT NULL,
            severity TEXT NOT NULL,
            threshold REAL NOT NULL,
            reason TEXT NOT NULL,
            duration_ms INTEGER,
            resolved_ms INTEGER,
            cascade_incident_id TEXT,
            tags_json TEXT NOT NULL DEFAULT '{}',
            created_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cascade_incidents (
            id TEXT PRIMARY KEY,
            dedupe_key TEXT NOT NULL UNIQUE,
            pattern TEXT NOT NULL,
            label TEXT NOT NULL,
            start_ms INTEGER NOT NULL,
            end_ms INTEGER NOT NULL,
            confidence REAL NOT NULL,
            chain_json TEXT NOT NULL,
            created_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_samples_ingested ON metric_samples(ingested_ms);
        CREATE INDEX IF NOT EXISTS idx_samples_ts ON metric_samples(ts_ms);
        CREATE INDEX IF NOT EXISTS idx_samples_series ON metric_samples(component, metric_name, ts_ms);
        CREATE INDEX IF NOT EXISTS idx_anomaly_ts ON anomaly_events(ts_ms);
        CREATE INDEX IF NOT EXISTS idx_anomaly_created ON anomaly_events(created_ms);
        CREATE INDEX IF NOT EXISTS idx_anomaly_series ON anomaly_events(component, metric_name, host, ts_ms);
        CREATE INDEX IF NOT EXISTS idx_anomaly_open ON anomaly_events(resolved_ms, severity);
        CREATE INDEX IF NOT EXISTS idx_incidents_span ON cascade_incidents(start_ms, end_ms);",
    )?;
    record_version(conn)
}

/// Run all pending migrations on the rollup database.
pub fn migrate_rollups(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_VERSION_TABLE)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS rollup_buckets (
            granularity_secs INTEGER NOT NULL,
            bucket_start_ms INTEGER NOT NULL,
            component TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            sample_count INTEGER NOT NULL,
            mean REAL NOT NULL,
            m2 REAL NOT NULL,
            min_value REAL NOT NULL,
            max_value REAL NOT NULL,
            revised_ms INTEGER NOT NULL,
            PRIMARY KEY (granularity_secs, bucket_start_ms, component, metric_name)
        );

        CREATE INDEX IF NOT EXISTS idx_rollup_series
            ON rollup_buckets(component, metric_name, granularity_secs, bucket_start_ms);",
    )?;
    record_version(conn)
}
