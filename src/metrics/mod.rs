//! Raw metric samples from the broker, stream processor and analytics store.

pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Input errors raised at the ingestion boundary. A sample that fails
/// validation never reaches evaluation, rollups or storage.
#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    #[error("sample is missing a timestamp")]
    MissingTimestamp,
    #[error("invalid timestamp '{0}': expected RFC 3339")]
    InvalidTimestamp(String),
    #[error("unknown component '{0}'")]
    UnknownComponent(String),
    #[error("metric name must not be empty")]
    EmptyMetricName,
    #[error("sample for '{0}' is missing a value")]
    MissingValue(String),
    #[error("non-finite value {value} for metric '{metric}'")]
    NonFiniteValue { metric: String, value: f64 },
}

/// The monitored components, in data-flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Broker,
    StreamProcessor,
    AnalyticsStore,
}

impl Component {
    /// All components, upstream first.
    pub const ALL: [Component; 3] = [
        Component::Broker,
        Component::StreamProcessor,
        Component::AnalyticsStore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Broker => "broker",
            Component::StreamProcessor => "stream-processor",
            Component::AnalyticsStore => "analytics-store",
        }
    }

    /// Position in the broker -> processor -> store dependency chain.
    pub fn stage(&self) -> usize {
        match self {
            Component::Broker => 0,
            Component::StreamProcessor => 1,
            Component::AnalyticsStore => 2,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = SampleError;

    /// Accepts the canonical names plus the product names collectors
    /// commonly emit (kafka, flink, clickhouse).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broker" | "kafka" => Ok(Component::Broker),
            "stream-processor" | "stream_processor" | "processor" | "flink" => {
                Ok(Component::StreamProcessor)
            }
            "analytics-store" | "analytics_store" | "store" | "clickhouse" => {
                Ok(Component::AnalyticsStore)
            }
            _ => Err(SampleError::UnknownComponent(s.to_string())),
        }
    }
}

/// One immutable observation of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub component: Component,
    pub metric: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub host: String,
    pub cluster: String,
    pub environment: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl MetricSample {
    /// Build a sample with default placement (`server-01`, `main-cluster`,
    /// `production`).
    pub fn new(
        component: Component,
        metric: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            component,
            metric: metric.into(),
            value,
            unit: None,
            host: "server-01".to_string(),
            cluster: "main-cluster".to_string(),
            environment: "production".to_string(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Reject samples that cannot be evaluated or aggregated.
    pub fn validate(&self) -> Result<(), SampleError> {
        if self.metric.trim().is_empty() {
            return Err(SampleError::EmptyMetricName);
        }
        if !self.value.is_finite() {
            return Err(SampleError::NonFiniteValue {
                metric: self.metric.clone(),
                value: self.value,
            });
        }
        Ok(())
    }
}

/// Wire shape of a sample as delivered by collectors. Everything is
/// optional or stringly typed so that classification happens here rather
/// than as an opaque deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSample {
    #[serde(default, alias = "time")]
    pub timestamp: Option<String>,
    pub component: String,
    #[serde(alias = "metric_name")]
    pub metric: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl TryFrom<RawSample> for MetricSample {
    type Error = SampleError;

    fn try_from(raw: RawSample) -> Result<Self, Self::Error> {
        let ts_str = raw.timestamp.ok_or(SampleError::MissingTimestamp)?;
        let timestamp = DateTime::parse_from_rfc3339(ts_str.trim())
            .map_err(|_| SampleError::InvalidTimestamp(ts_str.clone()))?
            .with_timezone(&Utc);
        let component: Component = raw.component.parse()?;
        let value = raw
            .value
            .ok_or_else(|| SampleError::MissingValue(raw.metric.clone()))?;

        let mut sample = MetricSample::new(component, raw.metric, value, timestamp);
        sample.unit = raw.unit;
        if let Some(host) = raw.host {
            sample.host = host;
        }
        if let Some(cluster) = raw.cluster {
            sample.cluster = cluster;
        }
        if let Some(environment) = raw.environment {
            sample.environment = environment;
        }
        sample.tags = raw.tags;

        sample.validate()?;
        Ok(sample)
    }
}
