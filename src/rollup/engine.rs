//! Incremental rollup maintenance.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::metrics::MetricSample;
use crate::rollup::{Aggregate, Granularity, RollupSettings};
use crate::storage::{to_millis, Pool};

/// Which granularities a sample was merged into and which refused it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollupReport {
    pub merged: Vec<Granularity>,
    /// Buckets already closed and the sample older than the lateness bound.
    pub sealed: Vec<Granularity>,
}

#[derive(Clone)]
pub struct RollupEngine {
    pool: Pool,
    settings: RollupSettings,
}

impl RollupEngine {
    pub fn new(pool: Pool, settings: RollupSettings) -> Self {
        Self { pool, settings }
    }

    pub fn settings(&self) -> &RollupSettings {
        &self.settings
    }

    /// Merge one sample into its bucket at every configured granularity.
    ///
    /// The read-modify-write of all touched buckets runs in one `IMMEDIATE`
    /// transaction, so concurrent ingests of the same series serialize on
    /// the database write lock instead of losing updates.
    pub fn ingest(&self, sample: &MetricSample, now: DateTime<Utc>) -> Result<RollupReport> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut report = RollupReport::default();

        let lateness = now - sample.timestamp;
        for &granularity in &self.settings.granularities {
            let start = granularity.bucket_start(sample.timestamp);
            let end = start + granularity.duration();
            let closed = now >= end + self.settings.grace;

            if closed && lateness > self.settings.max_lateness {
                debug!(
                    component = %sample.component,
                    metric = %sample.metric,
                    granularity = %granularity,
                    lateness_secs = lateness.num_seconds(),
                    "Sample too late for sealed bucket"
                );
                report.sealed.push(granularity);
                continue;
            }

            let mut agg = tx
                .query_row(
                    "SELECT sample_count, mean, m2, min_value, max_value FROM rollup_buckets
                     WHERE granularity_secs = ?1 AND bucket_start_ms = ?2
                       AND component = ?3 AND metric_name = ?4",
                    params![
                        granularity.secs(),
                        to_millis(start),
                        sample.component.as_str(),
                        sample.metric
                    ],
                    |row| {
                        Ok(Aggregate {
                            count: row.get::<_, i64>(0)? as u64,
                            mean: row.get(1)?,
                            m2: row.get(2)?,
                            min: row.get(3)?,
                            max: row.get(4)?,
                        })
                    },
                )
                .optional()?
                .unwrap_or_default();
            agg.push(sample.value);

            tx.execute(
                "INSERT INTO rollup_buckets
                    (granularity_secs, bucket_start_ms, component, metric_name,
                     sample_count, mean, m2, min_value, max_value, revised_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (granularity_secs, bucket_start_ms, component, metric_name) DO UPDATE SET
                    sample_count = excluded.sample_count,
                    mean = excluded.mean,
                    m2 = excluded.m2,
                    min_value = excluded.min_value,
                    max_value = excluded.max_value,
                    revised_ms = excluded.revised_ms",
                params![
                    granularity.secs(),
                    to_millis(start),
                    sample.component.as_str(),
                    sample.metric,
                    agg.count as i64,
                    agg.mean,
                    agg.m2,
                    agg.min,
                    agg.max,
                    to_millis(now),
                ],
            )?;
            report.merged.push(granularity);
        }

        tx.commit().context("Failed to commit rollup update")?;
        Ok(report)
    }
}
