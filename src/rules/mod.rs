//! Severity-tiered threshold rules.
//!
//! A [`RuleTable`] maps (component, metric) to an ordered list of tiers.
//! Tiers are authored most-severe-first and evaluated top-down; the first
//! tier whose comparison holds wins. The table is immutable once built;
//! [`book::RuleBook`] swaps whole tables on reload.

pub mod book;
pub mod defaults;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::Severity;
use crate::metrics::{Component, MetricSample};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rule file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("rule table version must not be empty")]
    EmptyVersion,
    #[error("tier {index} has an empty metric name")]
    EmptyMetric { index: usize },
    #[error("tier {index} for {component}/{metric} has non-finite threshold")]
    InvalidThreshold {
        index: usize,
        component: Component,
        metric: String,
    },
    #[error(
        "tier {index} for {component}/{metric} can never match: shadowed by an earlier tier ({shadowed_by})"
    )]
    ShadowedTier {
        index: usize,
        component: Component,
        metric: String,
        shadowed_by: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "gt")]
    GreaterThan,
    #[serde(rename = "lt")]
    LessThan,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => value > threshold,
            Comparison::LessThan => value < threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::GreaterThan => ">",
            Comparison::LessThan => "<",
        }
    }
}

/// One threshold rule with its severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTier {
    pub component: Component,
    pub metric: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    /// Supports `{component}`, `{metric}`, `{value}`, `{threshold}` and
    /// `{unit}` placeholders.
    pub reason: String,
}

impl RuleTier {
    pub fn matches(&self, value: f64) -> bool {
        self.comparison.holds(value, self.threshold)
    }

    pub fn render_reason(&self, sample: &MetricSample) -> String {
        self.reason
            .replace("{component}", sample.component.as_str())
            .replace("{metric}", &sample.metric)
            .replace("{value}", &format_number(sample.value))
            .replace("{threshold}", &format_number(self.threshold))
            .replace("{unit}", sample.unit.as_deref().unwrap_or(""))
    }

    fn describe(&self) -> String {
        format!(
            "{} {} {}",
            self.severity,
            self.comparison.symbol(),
            format_number(self.threshold)
        )
    }

    /// True when every value matching `self` also matches `earlier`, which
    /// makes `self` unreachable under first-match evaluation.
    fn is_shadowed_by(&self, earlier: &RuleTier) -> bool {
        if self.comparison != earlier.comparison {
            return false;
        }
        match self.comparison {
            Comparison::GreaterThan => self.threshold >= earlier.threshold,
            Comparison::LessThan => self.threshold <= earlier.threshold,
        }
    }
}

/// Integral values print without a fractional part ("100000", not
/// "100000.00").
pub(crate) fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{:.2}", v)
    }
}

/// On-disk shape of a rule file.
#[derive(Debug, Deserialize, Serialize)]
struct RuleFile {
    version: String,
    #[serde(default)]
    tiers: Vec<RuleTier>,
}

/// Immutable, versioned rule table.
#[derive(Debug, Clone)]
pub struct RuleTable {
    version: String,
    groups: HashMap<Component, HashMap<String, Vec<RuleTier>>>,
    len: usize,
}

impl RuleTable {
    /// Build and validate a table. Order within each (component, metric)
    /// group is the order of `tiers`.
    pub fn new(version: impl Into<String>, tiers: Vec<RuleTier>) -> Result<Self, RuleError> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(RuleError::EmptyVersion);
        }

        let mut groups: HashMap<Component, HashMap<String, Vec<RuleTier>>> = HashMap::new();
        for (index, tier) in tiers.iter().enumerate() {
            if tier.metric.trim().is_empty() {
                return Err(RuleError::EmptyMetric { index });
            }
            if !tier.threshold.is_finite() {
                return Err(RuleError::InvalidThreshold {
                    index,
                    component: tier.component,
                    metric: tier.metric.clone(),
                });
            }

            let group = groups
                .entry(tier.component)
                .or_default()
                .entry(tier.metric.clone())
                .or_default();
            if let Some(earlier) = group.iter().find(|e| tier.is_shadowed_by(e)) {
                return Err(RuleError::ShadowedTier {
                    index,
                    component: tier.component,
                    metric: tier.metric.clone(),
                    shadowed_by: earlier.describe(),
                });
            }
            group.push(tier.clone());
        }

        Ok(Self {
            version,
            groups,
            len: tiers.len(),
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RuleError> {
        let file: RuleFile = toml::from_str(content)?;
        Self::new(file.version, file.tiers)
    }

    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let content = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Tiers for one series in evaluation order; empty when unmonitored.
    pub fn tiers_for(&self, component: Component, metric: &str) -> &[RuleTier] {
        self.groups
            .get(&component)
            .and_then(|metrics| metrics.get(metric))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// All tiers grouped by component then metric name, each group in
    /// evaluation order.
    pub fn tiers(&self) -> Vec<&RuleTier> {
        let mut out = Vec::with_capacity(self.len);
        for component in Component::ALL {
            if let Some(metrics) = self.groups.get(&component) {
                let mut names: Vec<&String> = metrics.keys().collect();
                names.sort();
                for name in names {
                    out.extend(metrics[name].iter());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tier(metric: &str, cmp: Comparison, threshold: f64, severity: Severity) -> RuleTier {
        RuleTier {
            component: Component::Broker,
            metric: metric.to_string(),
            comparison: cmp,
            threshold,
            severity,
            reason: "{metric} = {value} vs {threshold}".to_string(),
        }
    }

    #[test]
    fn test_preserves_definition_order() {
        let table = RuleTable::new(
            "t1",
            vec![
                tier("lag", Comparison::GreaterThan, 100.0, Severity::Critical),
                tier("lag", Comparison::GreaterThan, 50.0, Severity::Warning),
            ],
        )
        .unwrap();
        let tiers = table.tiers_for(Component::Broker, "lag");
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0].severity, Severity::Critical);
        assert!(table.tiers_for(Component::Broker, "other").is_empty());
        assert!(table.tiers_for(Component::AnalyticsStore, "lag").is_empty());
    }

    #[test]
    fn test_rejects_unreachable_tier() {
        // Warning listed first swallows everything the critical tier would match.
        let err = RuleTable::new(
            "t1",
            vec![
                tier("heap", Comparison::GreaterThan, 80.0, Severity::Warning),
                tier("heap", Comparison::GreaterThan, 90.0, Severity::Critical),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::ShadowedTier { index: 1, .. }));

        let err = RuleTable::new(
            "t1",
            vec![
                tier("idle", Comparison::LessThan, 20.0, Severity::Warning),
                tier("idle", Comparison::LessThan, 10.0, Severity::Critical),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::ShadowedTier { .. }));
    }

    #[test]
    fn test_mixed_directions_are_allowed() {
        let table = RuleTable::new(
            "t1",
            vec![
                tier("rate", Comparison::GreaterThan, 1000.0, Severity::Critical),
                tier("rate", Comparison::LessThan, 10.0, Severity::Critical),
            ],
        )
        .unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_rejects_non_finite_threshold() {
        let err = RuleTable::new(
            "t1",
            vec![tier("lag", Comparison::GreaterThan, f64::NAN, Severity::Warning)],
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::InvalidThreshold { .. }));
    }

    #[test]
    fn test_parses_toml_rule_file() {
        let table = RuleTable::from_toml_str(
            r#"
version = "2024-06-01"

[[tiers]]
component = "broker"
metric = "consumer_lag"
comparison = "gt"
threshold = 100000
severity = "critical"
reason = "lag {value} above {threshold}"

[[tiers]]
component = "analytics-store"
metric = "disk_usage"
comparison = "gt"
threshold = 90.0
severity = "critical"
reason = "disk at {value}{unit}"
"#,
        )
        .unwrap();
        assert_eq!(table.version(), "2024-06-01");
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.tiers_for(Component::AnalyticsStore, "disk_usage")[0].threshold,
            90.0
        );
    }

    #[test]
    fn test_render_reason() {
        let t = tier("consumer_lag", Comparison::GreaterThan, 100000.0, Severity::Critical);
        let sample = MetricSample::new(Component::Broker, "consumer_lag", 150000.0, Utc::now());
        assert_eq!(
            t.render_reason(&sample),
            "consumer_lag = 150000 vs 100000"
        );
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(0.5), "0.50");
        assert_eq!(format_number(-3.0), "-3");
    }
}
