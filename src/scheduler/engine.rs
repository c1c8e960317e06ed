use crate::detect::correlation::CascadeCorrelator;
use crate::detect::incident::AnomalyStore;
use crate::detect::resolver::{expire_stale, ExpiryPolicy};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Correlator cadence loop. A failed pass is logged and skipped; the next
/// pass widens its window to cover the gap.
pub async fn run_correlation_loop(correlator: Arc<CascadeCorrelator>, every: Duration) {
    info!(interval_secs = every.as_secs(), "Correlator loop started");

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        correlation_pass(correlator.clone()).await;
    }
}

/// One correlator pass on the blocking pool. Returns the number of new
/// incidents, or `None` when the pass failed.
pub async fn correlation_pass(correlator: Arc<CascadeCorrelator>) -> Option<usize> {
    let result = tokio::task::spawn_blocking(move || correlator.correlate(Utc::now())).await;
    match result {
        Ok(Ok(incidents)) => {
            if !incidents.is_empty() {
                info!(new_incidents = incidents.len(), "Correlation pass complete");
            }
            Some(incidents.len())
        }
        Ok(Err(e)) => {
            error!("Correlation pass failed: {:#}", e);
            None
        }
        Err(e) => {
            error!("Correlation task panicked: {}", e);
            None
        }
    }
}

/// Auto-expiry loop for stale open anomalies.
pub async fn run_resolver_loop(store: AnomalyStore, policy: ExpiryPolicy, every: Duration) {
    info!(interval_secs = every.as_secs(), "Resolver loop started");

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let store = store.clone();
        let policy = policy.clone();
        match tokio::task::spawn_blocking(move || expire_stale(&store, &policy, Utc::now())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Resolver pass failed: {:#}", e),
            Err(e) => error!("Resolver task panicked: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::correlation::CorrelatorSettings;
    use crate::detect::{AnomalyEvent, Severity};
    use crate::metrics::Component;
    use crate::storage::test_pool;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn event(component: Component, minutes_ago: i64) -> AnomalyEvent {
        AnomalyEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now() - chrono::Duration::minutes(minutes_ago),
            component,
            metric: "m".to_string(),
            host: "server-01".to_string(),
            value: 1.0,
            severity: Severity::Critical,
            threshold: 0.0,
            reason: "test".to_string(),
            duration_estimate_ms: None,
            resolved_at: None,
            cascade_incident_id: None,
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn test_correlation_pass_reports_new_incidents() {
        let (_dir, pool) = test_pool();
        let store = AnomalyStore::new(pool.clone());
        store.append(&event(Component::Broker, 6)).unwrap();
        store.append(&event(Component::StreamProcessor, 4)).unwrap();
        store.append(&event(Component::AnalyticsStore, 2)).unwrap();

        let correlator = Arc::new(CascadeCorrelator::new(store, CorrelatorSettings::default()));
        assert_eq!(tokio_test::block_on(correlation_pass(correlator.clone())), Some(1));
        assert_eq!(tokio_test::block_on(correlation_pass(correlator)), Some(0));
    }

    #[test]
    fn test_correlation_pass_survives_storage_failure() {
        let (_dir, pool) = test_pool();
        pool.get()
            .unwrap()
            .execute_batch("DROP TABLE anomaly_events;")
            .unwrap();
        let correlator = Arc::new(CascadeCorrelator::new(
            AnomalyStore::new(pool),
            CorrelatorSettings::default(),
        ));
        assert_eq!(tokio_test::block_on(correlation_pass(correlator)), None);
    }
}
