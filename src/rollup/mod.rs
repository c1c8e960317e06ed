//! Time-bucketed rollups of raw samples.
//!
//! Every sample is merged into one bucket per configured granularity using
//! Welford's incremental mean/variance. A bucket stays *provisional* until
//! the wall clock passes `max(bucket_end, revised_at) + grace`; readers get
//! the flag, never an error.

pub mod engine;
pub mod query;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::Component;
use crate::storage::{from_millis, to_millis};

#[derive(Debug, Error, PartialEq)]
pub enum RollupError {
    #[error("unknown granularity '{0}': expected 1m, 5m or 1h")]
    UnknownGranularity(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl Granularity {
    /// Finest first.
    pub const ALL: [Granularity; 3] = [
        Granularity::OneMinute,
        Granularity::FiveMinutes,
        Granularity::OneHour,
    ];

    pub fn secs(&self) -> i64 {
        match self {
            Granularity::OneMinute => 60,
            Granularity::FiveMinutes => 300,
            Granularity::OneHour => 3600,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.secs())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::OneMinute => "1m",
            Granularity::FiveMinutes => "5m",
            Granularity::OneHour => "1h",
        }
    }

    /// `floor(ts / g) * g`.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.secs() * 1000;
        from_millis(to_millis(ts).div_euclid(width) * width)
    }

    /// First bucket boundary at or after `ts`.
    pub fn ceil(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.bucket_start(ts);
        if start == ts {
            start
        } else {
            start + self.duration()
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" | "1min" | "minute" => Ok(Granularity::OneMinute),
            "5m" | "5min" => Ok(Granularity::FiveMinutes),
            "1h" | "hour" => Ok(Granularity::OneHour),
            _ => Err(RollupError::UnknownGranularity(s.to_string())),
        }
    }
}

/// Running count/mean/M2/min/max.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for Aggregate {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Aggregate {
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut agg = Self::default();
        for v in values {
            agg.push(v);
        }
        agg
    }

    /// Welford update.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Combine two partial aggregates (Chan et al. parallel variance).
    pub fn merge(&mut self, other: &Aggregate) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let n = n_a + n_b;
        let delta = other.mean - self.mean;

        self.mean += delta * n_b / n;
        self.m2 += other.m2 + delta * delta * n_a * n_b / n;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sample standard deviation; 0 with fewer than two samples.
    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2.max(0.0) / (self.count - 1) as f64).sqrt()
        }
    }

    pub fn stats(&self) -> Option<Stats> {
        if self.is_empty() {
            return None;
        }
        Some(Stats {
            count: self.count,
            avg: self.mean,
            min: self.min,
            max: self.max,
            stddev: self.stddev(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

/// One rollup bucket covering `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub granularity: Granularity,
    pub component: Component,
    pub metric: String,
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub provisional: bool,
    pub revised_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) m2: f64,
}

impl RollupBucket {
    pub fn aggregate(&self) -> Aggregate {
        Aggregate {
            count: self.count,
            mean: self.avg,
            m2: self.m2,
            min: self.min,
            max: self.max,
        }
    }
}

/// A bucket is provisional until the wall clock passes
/// `max(end, revised_at) + grace`.
pub fn is_provisional(
    end: DateTime<Utc>,
    revised_at: DateTime<Utc>,
    grace: Duration,
    now: DateTime<Utc>,
) -> bool {
    now < end.max(revised_at) + grace
}

#[derive(Debug, Clone)]
pub struct RollupSettings {
    pub granularities: Vec<Granularity>,
    pub grace: Duration,
    /// Samples later than this are not merged into closed buckets.
    pub max_lateness: Duration,
}

impl Default for RollupSettings {
    fn default() -> Self {
        Self {
            granularities: Granularity::ALL.to_vec(),
            grace: Duration::seconds(60),
            max_lateness: Duration::minutes(5),
        }
    }
}
