//! Read-side facade over the metric store, rollups and anomaly store.
//!
//! Everything here is a pure read except [`QueryFacade::resolve`]. Logical
//! duplicate events (at-least-once appends) are collapsed before counting.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::detect::correlation::collapse_duplicates;
use crate::detect::incident::{AnomalyStore, EventFilter};
use crate::detect::{AnomalyEvent, CascadeIncident, Severity};
use crate::metrics::store::MetricStore;
use crate::metrics::{Component, MetricSample};
use crate::rollup::query::{RangeAggregate, RollupReader};
use crate::rollup::{Aggregate, Granularity, RollupBucket, RollupSettings, Stats};
use crate::storage::{hours_before, minutes_before, Storage};

const TOP_METRICS: usize = 5;
const TREND_WINDOW: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub component: Component,
    pub open_critical: usize,
    pub open_warning: usize,
    pub latest_anomaly: Option<DateTime<Utc>>,
    /// Most recent first.
    pub open_events: Vec<AnomalyEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentSummary {
    pub component: Component,
    pub warning: usize,
    pub critical: usize,
    pub distinct_metrics: usize,
    /// Mean of `resolved_at - timestamp`, with open events measured to now.
    pub mean_resolution_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricCount {
    pub component: Component,
    pub metric: String,
    pub anomalies: usize,
    pub critical: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalySummary {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total: usize,
    pub components: Vec<ComponentSummary>,
    pub top_metrics: Vec<MetricCount>,
    /// Value statistics for each top metric over the same window.
    pub metric_aggregates: Vec<RangeAggregate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricTrend {
    pub component: Component,
    pub metric: String,
    pub granularity: Granularity,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub buckets: Vec<RollupBucket>,
    pub latest_provisional: bool,
    pub overall: Option<Stats>,
    pub direction: TrendDirection,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentWithChain {
    #[serde(flatten)]
    pub incident: CascadeIncident,
    /// Chain events in chain order.
    pub events: Vec<AnomalyEvent>,
}

#[derive(Clone)]
pub struct QueryFacade {
    metrics: MetricStore,
    anomalies: AnomalyStore,
    rollups: RollupReader,
}

impl QueryFacade {
    pub fn new(storage: &Storage, rollup: RollupSettings) -> Self {
        let metrics = MetricStore::new(storage.events.clone());
        Self {
            rollups: RollupReader::new(storage.rollups.clone(), metrics.clone(), rollup),
            anomalies: AnomalyStore::new(storage.events.clone()),
            metrics,
        }
    }

    /// Open anomalies of the last `last_minutes` per component. Components
    /// with the most recent open anomaly come first.
    pub fn current_status(&self, last_minutes: i64, now: DateTime<Utc>) -> Result<Vec<ComponentStatus>> {
        let events = self.anomalies.query(&EventFilter {
            open_only: true,
            ..EventFilter::between(minutes_before(now, last_minutes)?, now)
        })?;
        let mut events = collapse_duplicates(events);
        events.reverse();

        let mut statuses: Vec<ComponentStatus> = Component::ALL
            .iter()
            .map(|&component| {
                let open_events: Vec<AnomalyEvent> = events
                    .iter()
                    .filter(|e| e.component == component)
                    .cloned()
                    .collect();
                ComponentStatus {
                    component,
                    open_critical: count_severity(&open_events, Severity::Critical),
                    open_warning: count_severity(&open_events, Severity::Warning),
                    latest_anomaly: open_events.first().map(|e| e.timestamp),
                    open_events,
                }
            })
            .collect();

        // Stable sort keeps flow order among quiet components.
        statuses.sort_by(|a, b| b.latest_anomaly.cmp(&a.latest_anomaly));
        Ok(statuses)
    }

    pub fn summary(&self, hours: i64, now: DateTime<Utc>) -> Result<AnomalySummary> {
        let from = hours_before(now, hours)?;
        let events = collapse_duplicates(self.anomalies.query(&EventFilter::between(from, now))?);

        let components = Component::ALL
            .iter()
            .map(|&component| {
                let own: Vec<&AnomalyEvent> =
                    events.iter().filter(|e| e.component == component).collect();
                let metrics: BTreeSet<&str> = own.iter().map(|e| e.metric.as_str()).collect();
                let mean_resolution_secs = if own.is_empty() {
                    None
                } else {
                    let total: i64 = own
                        .iter()
                        .map(|e| (e.resolved_at.unwrap_or(now) - e.timestamp).num_milliseconds())
                        .sum();
                    Some(total as f64 / own.len() as f64 / 1000.0)
                };
                ComponentSummary {
                    component,
                    warning: own.iter().filter(|e| e.severity == Severity::Warning).count(),
                    critical: own.iter().filter(|e| e.severity == Severity::Critical).count(),
                    distinct_metrics: metrics.len(),
                    mean_resolution_secs,
                }
            })
            .collect();

        let top_metrics = top_metrics(&events, TOP_METRICS);
        let metric_aggregates = top_metrics
            .iter()
            .map(|m| self.rollups.aggregate_range(m.component, &m.metric, from, now, now))
            .collect::<Result<Vec<_>>>()?;

        Ok(AnomalySummary {
            from,
            to: now,
            total: events.len(),
            components,
            top_metrics,
            metric_aggregates,
        })
    }

    pub fn trend(
        &self,
        component: Component,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> Result<MetricTrend> {
        let buckets = self.rollups.buckets(component, metric, granularity, from, to, now)?;

        let mut overall = Aggregate::default();
        for bucket in &buckets {
            overall.merge(&bucket.aggregate());
        }
        let averages: Vec<f64> = buckets.iter().map(|b| b.avg).collect();

        Ok(MetricTrend {
            component,
            metric: metric.to_string(),
            granularity,
            from,
            to,
            latest_provisional: buckets.last().map(|b| b.provisional).unwrap_or(false),
            overall: overall.stats(),
            direction: trend_direction(&averages),
            buckets,
        })
    }

    /// Incidents overlapping `[from, to]` with their events resolved.
    pub fn cross_component_incidents(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IncidentWithChain>> {
        self.anomalies
            .incidents_overlapping(from, to)?
            .into_iter()
            .map(|incident| {
                let events = self.anomalies.get_many(&incident.event_ids())?;
                Ok(IncidentWithChain { incident, events })
            })
            .collect()
    }

    /// Mark an event resolved. `Ok(false)` when it already was; unknown ids
    /// are an error.
    pub fn resolve(&self, event_id: Uuid, resolved_at: DateTime<Utc>) -> Result<bool> {
        self.anomalies.resolve(event_id, resolved_at)
    }

    /// Samples that arrived in the last `minutes`, newest first.
    pub fn recent_samples(&self, minutes: i64, now: DateTime<Utc>) -> Result<Vec<MetricSample>> {
        self.metrics.recent(minutes, now)
    }
}

fn count_severity(events: &[AnomalyEvent], severity: Severity) -> usize {
    events.iter().filter(|e| e.severity == severity).count()
}

fn top_metrics(events: &[AnomalyEvent], limit: usize) -> Vec<MetricCount> {
    let mut counts: BTreeMap<(Component, &str), (usize, usize)> = BTreeMap::new();
    for e in events {
        let entry = counts.entry((e.component, e.metric.as_str())).or_default();
        entry.0 += 1;
        if e.severity == Severity::Critical {
            entry.1 += 1;
        }
    }

    let mut ranked: Vec<MetricCount> = counts
        .into_iter()
        .map(|((component, metric), (anomalies, critical))| MetricCount {
            component,
            metric: metric.to_string(),
            anomalies,
            critical,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.anomalies
            .cmp(&a.anomalies)
            .then(b.critical.cmp(&a.critical))
    });
    ranked.truncate(limit);
    ranked
}

/// Compare the mean of the newest ten bucket averages with the oldest ten
/// (fewer when the series is short): more than 20% up is increasing, more
/// than 20% down is decreasing. `averages` is oldest first.
pub fn trend_direction(averages: &[f64]) -> TrendDirection {
    if averages.len() < 2 {
        return TrendDirection::Stable;
    }
    let k = averages.len().min(TREND_WINDOW);
    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;
    let older = mean(&averages[..k]);
    let recent = mean(&averages[averages.len() - k..]);

    if recent > older * 1.2 {
        TrendDirection::Increasing
    } else if recent < older * 0.8 {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    }
}
