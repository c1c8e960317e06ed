//! Append-only storage of raw samples.
//!
//! Rows are keyed by arrival (`ingested_ms`) as well as by sample time, so
//! both "what arrived recently" and "what happened in this range" are
//! index scans.

use crate::metrics::{Component, MetricSample};
use crate::storage::{from_millis, minutes_before, parse_column, to_millis, Pool};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

#[derive(Clone)]
pub struct MetricStore {
    pool: Pool,
}

impl MetricStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Append one sample. Returns the row id.
    pub fn append(&self, sample: &MetricSample, ingested_at: DateTime<Utc>) -> Result<i64> {
        let conn = self.pool.get()?;
        let tags_json = serde_json::to_string(&sample.tags)?;

        conn.execute(
            "INSERT INTO metric_samples
                (ts_ms, ingested_ms, component, metric_name, value, unit, host, cluster, environment, tags_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                to_millis(sample.timestamp),
                to_millis(ingested_at),
                sample.component.as_str(),
                sample.metric,
                sample.value,
                sample.unit,
                sample.host,
                sample.cluster,
                sample.environment,
                tags_json
            ],
        )
        .context("Failed to insert metric sample")?;

        Ok(conn.last_insert_rowid())
    }

    /// Samples that arrived in the last `minutes`, newest first.
    pub fn recent(&self, minutes: i64, now: DateTime<Utc>) -> Result<Vec<MetricSample>> {
        let conn = self.pool.get()?;
        let since = to_millis(minutes_before(now, minutes)?);
        let mut stmt = conn.prepare(
            "SELECT ts_ms, component, metric_name, value, unit, host, cluster, environment, tags_json
             FROM metric_samples
             WHERE ingested_ms >= ?1
             ORDER BY ingested_ms DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![since], row_to_sample)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read recent samples")
    }

    /// Samples of one series with timestamp in `[from, to)`, oldest first.
    pub fn range(
        &self,
        component: Component,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT ts_ms, component, metric_name, value, unit, host, cluster, environment, tags_json
             FROM metric_samples
             WHERE component = ?1 AND metric_name = ?2 AND ts_ms >= ?3 AND ts_ms < ?4
             ORDER BY ts_ms ASC, id ASC",
        )?;
        let rows = stmt.query_map(
            params![component.as_str(), metric, to_millis(from), to_millis(to)],
            row_to_sample,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read sample range")
    }

    /// Values only, for aggregate fallbacks that don't need the full row.
    pub fn values_in(
        &self,
        component: Component,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<f64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT value FROM metric_samples
             WHERE component = ?1 AND metric_name = ?2 AND ts_ms >= ?3 AND ts_ms < ?4",
        )?;
        let rows = stmt.query_map(
            params![component.as_str(), metric, to_millis(from), to_millis(to)],
            |row| row.get::<_, f64>(0),
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to scan sample values")
    }
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricSample> {
    let component: String = row.get(1)?;
    let tags_json: String = row.get(8)?;
    Ok(MetricSample {
        timestamp: from_millis(row.get(0)?),
        component: parse_column(1, &component)?,
        metric: row.get(2)?,
        value: row.get(3)?,
        unit: row.get(4)?,
        host: row.get(5)?,
        cluster: row.get(6)?,
        environment: row.get(7)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
    })
}
