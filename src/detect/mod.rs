//! Anomaly detection, the anomaly store, and cross-component correlation.

pub mod correlation;
pub mod evaluator;
pub mod incident;
pub mod resolver;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::Component;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),
    #[error("unknown incident pattern '{0}'")]
    UnknownPattern(String),
    #[error("anomaly event {0} not found")]
    EventNotFound(Uuid),
}

/// Severity levels for rule tiers and anomaly events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// Weight used when scoring incident confidence.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Warning => 0.5,
            Severity::Critical => 1.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(DetectError::UnknownSeverity(s.to_string())),
        }
    }
}

/// A classified anomaly. Only `resolved_at` and `cascade_incident_id` ever
/// change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: Uuid,
    /// Timestamp of the sample that triggered the event.
    pub timestamp: DateTime<Utc>,
    pub component: Component,
    pub metric: String,
    pub host: String,
    pub value: f64,
    pub severity: Severity,
    pub threshold: f64,
    pub reason: String,
    /// How long the condition had been open for this series when this
    /// event was recorded.
    pub duration_estimate_ms: Option<i64>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cascade_incident_id: Option<Uuid>,
    pub tags: BTreeMap<String, String>,
}

impl AnomalyEvent {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentPattern {
    /// Ordered broker -> processor -> store chain.
    Cascade,
    /// Many metrics of one component breaching at once.
    ResourceExhaustion,
}

impl IncidentPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentPattern::Cascade => "cascade",
            IncidentPattern::ResourceExhaustion => "resource_exhaustion",
        }
    }
}

impl FromStr for IncidentPattern {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cascade" => Ok(IncidentPattern::Cascade),
            "resource_exhaustion" => Ok(IncidentPattern::ResourceExhaustion),
            _ => Err(DetectError::UnknownPattern(s.to_string())),
        }
    }
}

/// One hop of an incident's event chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLink {
    pub component: Component,
    pub metric: String,
    pub event_id: Uuid,
}

/// A cluster of anomaly events linked by the correlator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeIncident {
    pub id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub chain: Vec<ChainLink>,
    pub pattern: IncidentPattern,
    pub label: String,
    pub confidence: f64,
    /// Deterministic key derived from the chain; the store refuses a second
    /// incident with the same key.
    pub dedupe_key: String,
}

impl CascadeIncident {
    pub fn event_ids(&self) -> Vec<Uuid> {
        self.chain.iter().map(|l| l.event_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_and_parse() {
        assert!(Severity::Critical > Severity::Warning);
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("info".parse::<Severity>().is_err());
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        let json = serde_json::to_string(&Severity::Warning).unwrap();
        assert_eq!(json, "\"warning\"");
    }

    #[test]
    fn test_pattern_roundtrips_through_str() {
        for p in [IncidentPattern::Cascade, IncidentPattern::ResourceExhaustion] {
            assert_eq!(p.as_str().parse::<IncidentPattern>().unwrap(), p);
        }
    }
}
