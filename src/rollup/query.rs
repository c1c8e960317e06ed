//! Reads over rollup buckets, including arbitrary-range aggregation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::metrics::store::MetricStore;
use crate::metrics::Component;
use crate::rollup::{is_provisional, Aggregate, Granularity, RollupBucket, RollupSettings, Stats};
use crate::storage::{from_millis, to_millis, Pool};

/// Statistics for one series over `[from, to)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeAggregate {
    pub component: Component,
    pub metric: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// `None` when no samples fall in the range.
    pub stats: Option<Stats>,
    /// True when any contributing bucket (or the raw edge) may still change.
    pub provisional: bool,
    pub buckets_used: usize,
    pub raw_samples_scanned: usize,
}

#[derive(Clone)]
pub struct RollupReader {
    pool: Pool,
    metrics: MetricStore,
    settings: RollupSettings,
}

impl RollupReader {
    pub fn new(pool: Pool, metrics: MetricStore, settings: RollupSettings) -> Self {
        Self {
            pool,
            metrics,
            settings,
        }
    }

    /// Buckets of one series whose start lies in `[from, to)`, oldest first,
    /// each flagged provisional or final as of `now`.
    pub fn buckets(
        &self,
        component: Component,
        metric: &str,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RollupBucket>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT bucket_start_ms, sample_count, mean, m2, min_value, max_value, revised_ms
             FROM rollup_buckets
             WHERE granularity_secs = ?1 AND component = ?2 AND metric_name = ?3
               AND bucket_start_ms >= ?4 AND bucket_start_ms < ?5
             ORDER BY bucket_start_ms ASC",
        )?;

        let grace = self.settings.grace;
        let rows = stmt.query_map(
            params![
                granularity.secs(),
                component.as_str(),
                metric,
                to_millis(from),
                to_millis(to)
            ],
            |row| {
                let start = from_millis(row.get(0)?);
                let end = start + granularity.duration();
                let revised_at = from_millis(row.get(6)?);
                let agg = Aggregate {
                    count: row.get::<_, i64>(1)? as u64,
                    mean: row.get(2)?,
                    m2: row.get(3)?,
                    min: row.get(4)?,
                    max: row.get(5)?,
                };
                Ok(RollupBucket {
                    start,
                    end,
                    granularity,
                    component,
                    metric: metric.to_string(),
                    count: agg.count,
                    avg: agg.mean,
                    min: agg.min,
                    max: agg.max,
                    stddev: agg.stddev(),
                    provisional: is_provisional(end, revised_at, grace, now),
                    revised_at,
                    m2: agg.m2,
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read rollup buckets")
    }

    /// Aggregate any `[from, to)` range: whole buckets of the coarsest
    /// granularity that fit, finer buckets toward the edges, and raw samples
    /// for whatever is left below one minute.
    pub fn aggregate_range(
        &self,
        component: Component,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RangeAggregate> {
        let mut coarse_first = self.settings.granularities.clone();
        coarse_first.sort();
        coarse_first.dedup();
        coarse_first.reverse();

        let mut acc = RangeAggregate {
            component,
            metric: metric.to_string(),
            from,
            to,
            stats: None,
            provisional: false,
            buckets_used: 0,
            raw_samples_scanned: 0,
        };
        let mut agg = Aggregate::default();
        if from < to {
            self.cover(component, metric, from, to, &coarse_first, now, &mut agg, &mut acc)?;
        }
        acc.stats = agg.stats();
        Ok(acc)
    }

    #[allow(clippy::too_many_arguments)]
    fn cover(
        &self,
        component: Component,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        granularities: &[Granularity],
        now: DateTime<Utc>,
        agg: &mut Aggregate,
        acc: &mut RangeAggregate,
    ) -> Result<()> {
        if from >= to {
            return Ok(());
        }

        let Some((&g, finer)) = granularities.split_first() else {
            let values = self.metrics.values_in(component, metric, from, to)?;
            acc.raw_samples_scanned += values.len();
            if !values.is_empty() && now < to + self.settings.grace {
                acc.provisional = true;
            }
            agg.merge(&Aggregate::from_values(values));
            return Ok(());
        };

        let inner_start = g.ceil(from);
        let inner_end = g.bucket_start(to);
        if inner_start >= inner_end {
            return self.cover(component, metric, from, to, finer, now, agg, acc);
        }

        self.cover(component, metric, from, inner_start, finer, now, agg, acc)?;
        for bucket in self.buckets(component, metric, g, inner_start, inner_end, now)? {
            agg.merge(&bucket.aggregate());
            acc.buckets_used += 1;
            acc.provisional |= bucket.provisional;
        }
        self.cover(component, metric, inner_end, to, finer, now, agg, acc)
    }
}
