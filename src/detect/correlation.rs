//! Cross-component correlation: links anomaly events into cascade chains
//! (broker -> stream processor -> analytics store) and flags resource
//! exhaustion when one component breaches on many metrics at once.

use crate::detect::incident::{AnomalyStore, EventFilter};
use crate::detect::{AnomalyEvent, CascadeIncident, ChainLink, IncidentPattern};
use crate::metrics::Component;
use crate::storage::{from_millis, to_millis};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

const NEVER: i64 = i64::MIN;

#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    /// Trailing window scanned on each pass.
    pub window: Duration,
    /// Largest allowed gap between consecutive hops of a cascade.
    pub max_lag: Duration,
    pub exhaustion_bucket: Duration,
    pub min_exhaustion_metrics: usize,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            window: Duration::minutes(15),
            max_lag: Duration::minutes(5),
            exhaustion_bucket: Duration::minutes(1),
            min_exhaustion_metrics: 3,
        }
    }
}

/// Correlates stored anomaly events into incidents.
pub struct CascadeCorrelator {
    store: AnomalyStore,
    settings: CorrelatorSettings,
    last_success: AtomicI64,
}

impl CascadeCorrelator {
    pub fn new(store: AnomalyStore, settings: CorrelatorSettings) -> Self {
        Self {
            store,
            settings,
            last_success: AtomicI64::new(NEVER),
        }
    }

    pub fn settings(&self) -> &CorrelatorSettings {
        &self.settings
    }

    /// Start of the scan window for a pass at `now`. After a missed pass the
    /// window reaches back to cover everything since the last success.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let trailing = now - self.settings.window;
        match self.last_success.load(Ordering::Acquire) {
            NEVER => trailing,
            ms => trailing.min(from_millis(ms) - self.settings.window),
        }
    }

    /// One correlation pass. Returns the incidents recorded by this pass;
    /// incidents already on record are skipped, so reruns over the same
    /// events return nothing new.
    ///
    /// Events stored since the window start are scanned even when their
    /// timestamp is older, together with the neighbours a chain through
    /// them could reach.
    pub fn correlate(&self, now: DateTime<Utc>) -> Result<Vec<CascadeIncident>> {
        let from = self.window_start(now);
        let events = collapse_duplicates(self.scan(from, now)?);
        debug!(events = events.len(), from = %from, "Correlation pass");

        let mut candidates = find_cascades(&events, self.settings.max_lag);
        candidates.extend(find_exhaustion(&events, &self.settings));

        let mut recorded = Vec::new();
        for incident in candidates {
            if self.store.record_incident(&incident)? {
                info!(
                    incident = %incident.id,
                    pattern = incident.pattern.as_str(),
                    confidence = incident.confidence,
                    label = %incident.label,
                    "Incident recorded"
                );
                recorded.push(incident);
            }
        }

        self.last_success.store(to_millis(now), Ordering::Release);
        Ok(recorded)
    }

    fn scan(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<AnomalyEvent>> {
        let mut events = self.store.query(&EventFilter {
            created_from: Some(from),
            ..EventFilter::between(from, now)
        })?;

        let Some(earliest) = events.iter().map(|e| e.timestamp).min().filter(|t| *t < from) else {
            return Ok(events);
        };
        // A full chain spans two hops.
        let reach = self.settings.max_lag + self.settings.max_lag;
        let lower = earliest.checked_sub_signed(reach).unwrap_or(earliest);
        let seen: HashSet<Uuid> = events.iter().map(|e| e.id).collect();
        let neighbours = self.store.query(&EventFilter::between(lower, from))?;
        debug!(
            late_from = %earliest,
            neighbours = neighbours.len(),
            "Correlation pass reaches back for late events"
        );
        events.extend(neighbours.into_iter().filter(|e| !seen.contains(&e.id)));
        Ok(events)
    }
}

/// Drop logical duplicates (same component, metric, host, timestamp, value
/// and severity). Copies already attached to an incident are kept in
/// preference to unattached ones.
pub fn collapse_duplicates(mut events: Vec<AnomalyEvent>) -> Vec<AnomalyEvent> {
    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.cascade_incident_id.is_none().cmp(&b.cascade_incident_id.is_none()))
            .then(a.id.cmp(&b.id))
    });

    let mut seen = HashSet::new();
    events.retain(|e| {
        seen.insert((
            e.component,
            e.metric.clone(),
            e.host.clone(),
            to_millis(e.timestamp),
            e.value.to_bits(),
            e.severity,
        ))
    });
    events
}

/// Greedy chain matching over unattached events: for each broker event in
/// time order, take the earliest unused processor event within `max_lag`
/// that can itself be followed by an unused store event within `max_lag`.
pub fn find_cascades(events: &[AnomalyEvent], max_lag: Duration) -> Vec<CascadeIncident> {
    let mut stages: [Vec<&AnomalyEvent>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for event in events.iter().filter(|e| e.cascade_incident_id.is_none()) {
        stages[event.component.stage()].push(event);
    }
    for stage in stages.iter_mut() {
        stage.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    }

    let mut used: HashSet<Uuid> = HashSet::new();
    let mut incidents = Vec::new();

    for broker in &stages[0] {
        let chain = stages[1]
            .iter()
            .filter(|p| !used.contains(&p.id) && follows(broker, p, max_lag))
            .find_map(|processor| {
                stages[2]
                    .iter()
                    .find(|s| !used.contains(&s.id) && follows(processor, s, max_lag))
                    .map(|store| [*broker, *processor, *store])
            });

        if let Some(chain) = chain {
            used.extend(chain.iter().map(|e| e.id));
            incidents.push(cascade_incident(&chain, max_lag));
        }
    }

    incidents
}

fn follows(up: &AnomalyEvent, down: &AnomalyEvent, max_lag: Duration) -> bool {
    down.timestamp >= up.timestamp && down.timestamp - up.timestamp <= max_lag
}

fn cascade_incident(chain: &[&AnomalyEvent; 3], max_lag: Duration) -> CascadeIncident {
    let dedupe_key = format!("cascade:{}>{}>{}", chain[0].id, chain[1].id, chain[2].id);

    let hops = chain.len() - 1;
    let total_gap = (chain[hops].timestamp - chain[0].timestamp).num_milliseconds() as f64;
    let mean_gap = total_gap / hops as f64;
    let tightness = 1.0 - mean_gap / max_lag.num_milliseconds().max(1) as f64;

    let label = chain
        .iter()
        .map(|e| format!("{} {}", e.component, e.metric))
        .collect::<Vec<_>>()
        .join(" -> ");

    CascadeIncident {
        id: incident_id(&dedupe_key),
        start: chain[0].timestamp,
        end: chain[hops].timestamp,
        chain: chain.iter().map(|e| link(e)).collect(),
        pattern: IncidentPattern::Cascade,
        label,
        confidence: confidence(tightness, hops, severity_score(chain.iter().copied())),
        dedupe_key,
    }
}

/// Components breaching on at least `min_exhaustion_metrics` distinct
/// metrics within one exhaustion bucket. All events count here, attached or
/// not; the store only back-references the unattached ones.
pub fn find_exhaustion(
    events: &[AnomalyEvent],
    settings: &CorrelatorSettings,
) -> Vec<CascadeIncident> {
    let bucket_ms = settings.exhaustion_bucket.num_milliseconds().max(1);

    let mut groups: BTreeMap<(Component, i64), Vec<&AnomalyEvent>> = BTreeMap::new();
    for event in events {
        let start = to_millis(event.timestamp).div_euclid(bucket_ms) * bucket_ms;
        groups.entry((event.component, start)).or_default().push(event);
    }

    let mut incidents = Vec::new();
    for ((component, bucket_start), mut group) in groups {
        let metrics: BTreeSet<String> = group.iter().map(|e| e.metric.clone()).collect();
        if metrics.len() < settings.min_exhaustion_metrics.max(1) {
            continue;
        }

        // Earliest event per metric forms the chain.
        group.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        let mut seen = HashSet::new();
        let chain: Vec<&AnomalyEvent> = group
            .into_iter()
            .filter(|e| seen.insert(e.metric.clone()))
            .collect();

        let (Some(first), Some(last)) = (chain.first(), chain.last()) else {
            continue;
        };
        let span = (last.timestamp - first.timestamp).num_milliseconds() as f64;
        let tightness = 1.0 - span / bucket_ms as f64;
        let dedupe_key = format!("exhaustion:{}:{}", component, bucket_start);

        incidents.push(CascadeIncident {
            id: incident_id(&dedupe_key),
            start: first.timestamp,
            end: last.timestamp,
            chain: chain.iter().map(|e| link(e)).collect(),
            pattern: IncidentPattern::ResourceExhaustion,
            label: format!(
                "{} resource exhaustion: {}",
                component,
                metrics.into_iter().collect::<Vec<_>>().join(", ")
            ),
            confidence: confidence(tightness, chain.len() - 1, severity_score(chain.iter().copied())),
            dedupe_key,
        });
    }

    incidents
}

/// Confidence in [0, 1], non-decreasing in each input:
/// `0.4 * tightness + 0.3 * hops / (hops + 1) + 0.3 * severity`, with
/// tightness and severity clamped to [0, 1].
pub fn confidence(tightness: f64, hops: usize, severity: f64) -> f64 {
    let hops = hops as f64;
    0.4 * unit(tightness) + 0.3 * (hops / (hops + 1.0)) + 0.3 * unit(severity)
}

fn unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

fn severity_score<'a>(events: impl Iterator<Item = &'a AnomalyEvent>) -> f64 {
    let (sum, n) = events.fold((0.0, 0usize), |(sum, n), e| (sum + e.severity.weight(), n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn incident_id(dedupe_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, dedupe_key.as_bytes())
}

fn link(event: &AnomalyEvent) -> ChainLink {
    ChainLink {
        component: event.component,
        metric: event.metric.clone(),
        event_id: event.id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;
    use crate::storage::test_pool;
    use std::collections::BTreeMap;

    fn base_time() -> DateTime<Utc> {
        // Minute-aligned so exhaustion buckets are predictable.
        let ms = to_millis(Utc::now() - Duration::minutes(30));
        from_millis(ms - ms.rem_euclid(60_000))
    }

    fn event(component: Component, metric: &str, severity: Severity, ts: DateTime<Utc>) -> AnomalyEvent {
        AnomalyEvent {
            id: Uuid::new_v4(),
            timestamp: ts,
            component,
            metric: metric.to_string(),
            host: "server-01".to_string(),
            value: 100.0,
            severity,
            threshold: 50.0,
            reason: "test".to_string(),
            duration_estimate_ms: None,
            resolved_at: None,
            cascade_incident_id: None,
            tags: BTreeMap::new(),
        }
    }

    fn cascade_events(t: DateTime<Utc>) -> [AnomalyEvent; 3] {
        [
            event(Component::Broker, "consumer_lag", Severity::Critical, t),
            event(Component::StreamProcessor, "backpressure", Severity::Critical, t + Duration::minutes(2)),
            event(Component::AnalyticsStore, "insert_latency", Severity::Warning, t + Duration::minutes(4)),
        ]
    }

    fn correlator() -> (tempfile::TempDir, AnomalyStore, CascadeCorrelator) {
        let (dir, pool) = test_pool();
        let store = AnomalyStore::new(pool);
        let correlator = CascadeCorrelator::new(store.clone(), CorrelatorSettings::default());
        (dir, store, correlator)
    }

    fn wall_clock() -> DateTime<Utc> {
        from_millis(to_millis(Utc::now()))
    }

    #[test]
    fn test_three_stage_cascade_yields_one_incident() {
        let (_dir, store, correlator) = correlator();
        let t = base_time();
        let events = cascade_events(t);
        for e in &events {
            store.append(e).unwrap();
        }

        let found = correlator.correlate(t + Duration::minutes(5)).unwrap();
        assert_eq!(found.len(), 1);
        let incident = &found[0];
        assert_eq!(incident.pattern, IncidentPattern::Cascade);
        assert_eq!(
            incident.chain.iter().map(|l| l.component).collect::<Vec<_>>(),
            Component::ALL.to_vec()
        );
        assert_eq!(incident.event_ids(), events.iter().map(|e| e.id).collect::<Vec<_>>());
        assert_eq!(incident.start, t);
        assert_eq!(incident.end, t + Duration::minutes(4));
        assert!(incident.confidence > 0.0 && incident.confidence <= 1.0);

        for e in store.get_many(&incident.event_ids()).unwrap() {
            assert_eq!(e.cascade_incident_id, Some(incident.id));
        }
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let (_dir, store, correlator) = correlator();
        let t = base_time();
        for e in &cascade_events(t) {
            store.append(e).unwrap();
        }

        assert_eq!(correlator.correlate(t + Duration::minutes(5)).unwrap().len(), 1);
        assert!(correlator.correlate(t + Duration::minutes(6)).unwrap().is_empty());
        assert!(correlator.correlate(t + Duration::minutes(6)).unwrap().is_empty());
        assert_eq!(store.incident_count().unwrap(), 1);
    }

    #[test]
    fn test_recomputed_chain_has_same_identity() {
        let (_dir, pool) = test_pool();
        let store = AnomalyStore::new(pool);
        let t = base_time();
        let events = cascade_events(t);

        let first = find_cascades(&events, Duration::minutes(5));
        assert!(store.record_incident(&first[0]).unwrap());

        // Same event ids produce the same key and id.
        let again = find_cascades(&events, Duration::minutes(5));
        assert_eq!(again[0].id, first[0].id);
        assert!(!store.record_incident(&again[0]).unwrap());
    }

    #[test]
    fn test_duplicate_rows_do_not_double_count() {
        let (_dir, store, correlator) = correlator();
        let t = base_time();
        let events = cascade_events(t);
        for e in &events {
            store.append(e).unwrap();
        }
        let dup = AnomalyEvent { id: Uuid::new_v4(), ..events[0].clone() };
        store.append(&dup).unwrap();

        let found = correlator.correlate(t + Duration::minutes(5)).unwrap();
        assert_eq!(found.len(), 1);
        assert!(correlator.correlate(t + Duration::minutes(6)).unwrap().is_empty());
        assert_eq!(store.incident_count().unwrap(), 1);
    }

    #[test]
    fn test_gap_beyond_max_lag_breaks_chain() {
        let t = base_time();
        let events = [
            event(Component::Broker, "consumer_lag", Severity::Critical, t),
            event(Component::StreamProcessor, "backpressure", Severity::Critical, t + Duration::minutes(6)),
            event(Component::AnalyticsStore, "insert_latency", Severity::Critical, t + Duration::minutes(7)),
        ];
        assert!(find_cascades(&events, Duration::minutes(5)).is_empty());
    }

    #[test]
    fn test_two_stage_chain_is_not_an_incident() {
        let t = base_time();
        let events = [
            event(Component::Broker, "consumer_lag", Severity::Critical, t),
            event(Component::StreamProcessor, "backpressure", Severity::Critical, t + Duration::minutes(1)),
        ];
        assert!(find_cascades(&events, Duration::minutes(5)).is_empty());
    }

    #[test]
    fn test_matching_backtracks_to_later_processor_event() {
        let t = base_time();
        let broker = event(Component::Broker, "consumer_lag", Severity::Critical, t);
        let early = event(Component::StreamProcessor, "latency", Severity::Warning, t + Duration::minutes(1));
        let late = event(Component::StreamProcessor, "backpressure", Severity::Critical, t + Duration::minutes(4));
        let store = event(Component::AnalyticsStore, "insert_latency", Severity::Critical, t + Duration::minutes(8));

        let found = find_cascades(&[broker, early, late.clone(), store], Duration::minutes(5));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].chain[1].event_id, late.id);
    }

    #[test]
    fn test_attached_events_are_not_reused() {
        let t = base_time();
        let mut events = cascade_events(t);
        events[1].cascade_incident_id = Some(Uuid::new_v4());
        assert!(find_cascades(&events, Duration::minutes(5)).is_empty());
    }

    #[test]
    fn test_resource_exhaustion() {
        let (_dir, store, correlator) = correlator();
        let t = base_time();
        let events = [
            event(Component::Broker, "jvm_heap_usage", Severity::Warning, t + Duration::seconds(5)),
            event(Component::Broker, "consumer_lag", Severity::Warning, t + Duration::seconds(10)),
            event(Component::Broker, "request_handler_idle_percent", Severity::Warning, t + Duration::seconds(20)),
        ];
        for e in &events {
            store.append(e).unwrap();
        }

        let found = correlator.correlate(t + Duration::minutes(2)).unwrap();
        assert_eq!(found.len(), 1);
        let incident = &found[0];
        assert_eq!(incident.pattern, IncidentPattern::ResourceExhaustion);
        assert_eq!(incident.chain.len(), 3);
        assert_eq!(
            incident.dedupe_key,
            format!("exhaustion:broker:{}", to_millis(t))
        );

        assert!(correlator.correlate(t + Duration::minutes(3)).unwrap().is_empty());
        assert_eq!(store.incident_count().unwrap(), 1);
    }

    #[test]
    fn test_late_member_joins_existing_exhaustion_incident() {
        let (_dir, store, correlator) = correlator();
        let t = base_time();
        for (metric, secs) in [("jvm_heap_usage", 5), ("consumer_lag", 10), ("request_handler_idle_percent", 20)] {
            store
                .append(&event(Component::Broker, metric, Severity::Warning, t + Duration::seconds(secs)))
                .unwrap();
        }
        let found = correlator.correlate(t + Duration::minutes(2)).unwrap();
        assert_eq!(found.len(), 1);

        let late = event(Component::Broker, "under_replicated_partitions", Severity::Critical, t + Duration::seconds(40));
        store.append(&late).unwrap();
        assert!(correlator.correlate(t + Duration::minutes(3)).unwrap().is_empty());
        assert_eq!(store.incident_count().unwrap(), 1);

        let stored = store.get(late.id).unwrap().unwrap();
        assert_eq!(stored.cascade_incident_id, Some(found[0].id));
        let incidents = store
            .incidents_overlapping(t, t + Duration::minutes(1))
            .unwrap();
        assert_eq!(incidents[0].chain.len(), 4);
        assert_eq!(incidents[0].end, t + Duration::seconds(40));
    }

    #[test]
    fn test_late_delivered_chain_is_correlated() {
        let (_dir, store, correlator) = correlator();
        let now = wall_clock();
        assert!(correlator.correlate(now).unwrap().is_empty());

        // Every hop happened before the next window but is delivered now.
        let events = cascade_events(now - Duration::minutes(20));
        for e in &events {
            store.append(e).unwrap();
        }

        let found = correlator.correlate(now + Duration::minutes(1)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event_ids(), events.iter().map(|e| e.id).collect::<Vec<_>>());
        assert!(correlator.correlate(now + Duration::minutes(2)).unwrap().is_empty());
        assert_eq!(store.incident_count().unwrap(), 1);
    }

    #[test]
    fn test_late_hop_completes_chain_with_older_neighbours() {
        let (_dir, pool) = test_pool();
        let store = AnomalyStore::new(pool.clone());
        let correlator = CascadeCorrelator::new(store.clone(), CorrelatorSettings::default());
        let now = wall_clock();

        let [broker, processor, analytics] = cascade_events(now - Duration::minutes(20));
        store.append(&broker).unwrap();
        store.append(&processor).unwrap();
        // Delivered on time, long before this pass.
        pool.get()
            .unwrap()
            .execute(
                "UPDATE anomaly_events SET created_ms = ?1",
                [to_millis(now - Duration::minutes(19))],
            )
            .unwrap();
        assert!(correlator.correlate(now).unwrap().is_empty());

        // The store hop (now - 16m) arrives late.
        store.append(&analytics).unwrap();
        let found = correlator.correlate(now + Duration::minutes(1)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event_ids(), vec![broker.id, processor.id, analytics.id]);
    }

    #[test]
    fn test_two_metrics_are_not_exhaustion() {
        let t = base_time();
        let events = [
            event(Component::Broker, "jvm_heap_usage", Severity::Warning, t),
            event(Component::Broker, "jvm_heap_usage", Severity::Critical, t + Duration::seconds(5)),
            event(Component::Broker, "consumer_lag", Severity::Warning, t + Duration::seconds(10)),
        ];
        assert!(find_exhaustion(&events, &CorrelatorSettings::default()).is_empty());
    }

    #[test]
    fn test_window_widens_after_missed_pass() {
        let (_dir, _store, correlator) = correlator();
        let now = base_time();
        assert_eq!(correlator.window_start(now), now - Duration::minutes(15));

        correlator
            .last_success
            .store(to_millis(now - Duration::hours(1)), Ordering::Release);
        assert_eq!(
            correlator.window_start(now),
            now - Duration::hours(1) - Duration::minutes(15)
        );
    }

    #[test]
    fn test_confidence_bounds_and_monotonicity() {
        let steps = [-1.0, 0.0, 0.25, 0.5, 0.75, 1.0, 2.0];
        for &t in &steps {
            for hops in 0..5 {
                for &s in &steps {
                    let c = confidence(t, hops, s);
                    assert!((0.0..=1.0).contains(&c), "{} {} {} -> {}", t, hops, s, c);
                    assert!(confidence(t + 0.1, hops, s) >= c);
                    assert!(confidence(t, hops + 1, s) >= c);
                    assert!(confidence(t, hops, s + 0.1) >= c);
                }
            }
        }
        assert_eq!(confidence(f64::NAN, 0, f64::NAN), 0.0);
    }
}
