//! Per-sample rule evaluation.

use std::sync::Arc;

use uuid::Uuid;

use crate::detect::AnomalyEvent;
use crate::metrics::MetricSample;
use crate::rules::book::RuleBook;
use crate::rules::RuleTable;

/// Tag recording which rule table classified an event.
pub const RULE_VERSION_TAG: &str = "rule_version";

#[derive(Clone)]
pub struct RuleEvaluator {
    rules: Arc<RuleBook>,
}

impl RuleEvaluator {
    pub fn new(rules: Arc<RuleBook>) -> Self {
        Self { rules }
    }

    /// Classify one sample against the rule table in effect now.
    pub fn evaluate(&self, sample: &MetricSample) -> Option<AnomalyEvent> {
        let table = self.rules.snapshot();
        evaluate_with(&table, sample)
    }
}

/// First matching tier wins. Series without tiers never produce an event.
pub fn evaluate_with(table: &RuleTable, sample: &MetricSample) -> Option<AnomalyEvent> {
    let tier = table
        .tiers_for(sample.component, &sample.metric)
        .iter()
        .find(|t| t.matches(sample.value))?;

    let mut tags = sample.tags.clone();
    tags.insert("cluster".to_string(), sample.cluster.clone());
    tags.insert("environment".to_string(), sample.environment.clone());
    tags.insert(RULE_VERSION_TAG.to_string(), table.version().to_string());
    if let Some(unit) = &sample.unit {
        tags.insert("unit".to_string(), unit.clone());
    }

    Some(AnomalyEvent {
        id: Uuid::new_v4(),
        timestamp: sample.timestamp,
        component: sample.component,
        metric: sample.metric.clone(),
        host: sample.host.clone(),
        value: sample.value,
        severity: tier.severity,
        threshold: tier.threshold,
        reason: tier.render_reason(sample),
        duration_estimate_ms: None,
        resolved_at: None,
        cascade_incident_id: None,
        tags,
    })
}
