//! Built-in rule table for the broker, stream processor and analytics store.

use crate::detect::Severity;
use crate::metrics::Component;
use crate::metrics::Component::{AnalyticsStore as Store, Broker, StreamProcessor as Processor};
use crate::rules::Comparison::{GreaterThan as Gt, LessThan as Lt};
use crate::rules::{format_number, Comparison, RuleTable, RuleTier};

pub const BUILTIN_VERSION: &str = "builtin-1";

/// (component, metric, comparison, warning threshold, critical threshold).
/// Equal thresholds produce a single critical tier.
const THRESHOLDS: &[(Component, &str, Comparison, f64, f64)] = &[
    // Broker
    (Broker, "under_replicated_partitions", Gt, 0.0, 5.0),
    (Broker, "offline_partitions", Gt, 0.0, 0.0),
    (Broker, "messages_in_per_sec", Gt, 75_000.0, 100_000.0),
    (Broker, "bytes_in_per_sec", Gt, 157_286_400.0, 209_715_200.0),
    (Broker, "bytes_out_per_sec", Gt, 314_572_800.0, 419_430_400.0),
    (Broker, "request_handler_idle_percent", Lt, 10.0, 5.0),
    (Broker, "network_processor_idle_percent", Lt, 20.0, 10.0),
    (Broker, "consumer_lag", Gt, 50_000.0, 100_000.0),
    (Broker, "consumer_lag_seconds", Gt, 300.0, 600.0),
    (Broker, "leader_election_rate", Gt, 0.5, 1.0),
    (Broker, "isr_shrink_rate", Gt, 0.1, 0.5),
    (Broker, "jvm_heap_usage", Gt, 80.0, 90.0),
    (Broker, "jvm_gc_pause_time", Gt, 200.0, 500.0),
    // Stream processor
    (Processor, "job_uptime", Lt, 1_800.0, 300.0),
    (Processor, "job_restarts", Gt, 5.0, 10.0),
    (Processor, "checkpoint_duration", Gt, 10_000.0, 30_000.0),
    (Processor, "checkpoint_size", Gt, 5_368_709_120.0, 10_737_418_240.0),
    (Processor, "checkpoint_failure_rate", Gt, 10.0, 20.0),
    (Processor, "heap_used", Gt, 80.0, 90.0),
    (Processor, "cpu_load", Gt, 85.0, 95.0),
    (Processor, "network_io", Gt, 800.0, 1_000.0),
    (Processor, "backpressure", Gt, 0.5, 0.8),
    (Processor, "records_lag", Gt, 100_000.0, 1_000_000.0),
    (Processor, "latency", Gt, 500.0, 1_000.0),
    (Processor, "watermark_lag", Gt, 5_000.0, 10_000.0),
    // Analytics store
    (Store, "query_duration", Gt, 5_000.0, 10_000.0),
    (Store, "queries_per_second", Gt, 2_000.0, 3_000.0),
    (Store, "slow_queries", Gt, 10.0, 20.0),
    (Store, "failed_queries", Gt, 5.0, 10.0),
    (Store, "disk_usage", Gt, 80.0, 90.0),
    (Store, "parts_count", Gt, 50_000.0, 100_000.0),
    (Store, "merge_time", Gt, 30.0, 60.0),
    (Store, "replication_lag", Gt, 30.0, 60.0),
    (Store, "replication_queue_size", Gt, 500.0, 1_000.0),
    (Store, "memory_usage", Gt, 80.0, 90.0),
    (Store, "memory_tracked", Gt, 100.0, 150.0),
    (Store, "connections", Gt, 800.0, 1_000.0),
    (Store, "http_connections", Gt, 400.0, 500.0),
    (Store, "insert_latency", Gt, 500.0, 1_000.0),
    (Store, "background_pool_tasks", Gt, 100.0, 200.0),
];

/// Tiers of the built-in table, critical before warning in every group.
pub fn builtin_tiers() -> Vec<RuleTier> {
    let mut tiers = Vec::with_capacity(THRESHOLDS.len() * 2);
    for &(component, metric, comparison, warning, critical) in THRESHOLDS {
        tiers.push(make_tier(component, metric, comparison, critical, Severity::Critical));
        if warning != critical {
            tiers.push(make_tier(component, metric, comparison, warning, Severity::Warning));
        }
    }
    tiers
}

/// The built-in table. Validity is covered by tests, so construction skips
/// re-validating on every start.
pub fn builtin_table() -> RuleTable {
    let tiers = builtin_tiers();
    let mut table = RuleTable {
        version: BUILTIN_VERSION.to_string(),
        groups: Default::default(),
        len: tiers.len(),
    };
    for tier in tiers {
        table
            .groups
            .entry(tier.component)
            .or_default()
            .entry(tier.metric.clone())
            .or_default()
            .push(tier);
    }
    table
}

fn make_tier(
    component: Component,
    metric: &str,
    comparison: Comparison,
    threshold: f64,
    severity: Severity,
) -> RuleTier {
    let direction = match comparison {
        Comparison::GreaterThan => "exceeds",
        Comparison::LessThan => "below",
    };
    RuleTier {
        component,
        metric: metric.to_string(),
        comparison,
        threshold,
        severity,
        reason: format!(
            "{{metric}} value {{value}}{{unit}} {} {} threshold {}",
            direction,
            severity,
            format_number(threshold)
        ),
    }
}
