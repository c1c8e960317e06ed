//! Auto-expiry of stale anomaly events.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::detect::incident::AnomalyStore;
use crate::detect::Severity;

/// How long an open event may stay open before it is resolved
/// automatically.
#[derive(Debug, Clone)]
pub struct ExpiryPolicy {
    pub warning_ttl: Duration,
    pub critical_ttl: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            warning_ttl: Duration::minutes(5),
            critical_ttl: Duration::minutes(10),
        }
    }
}

impl ExpiryPolicy {
    pub fn ttl(&self, severity: Severity) -> Duration {
        match severity {
            Severity::Warning => self.warning_ttl,
            Severity::Critical => self.critical_ttl,
        }
    }
}

/// Resolve open events older than their severity's TTL, stamping
/// `resolved_at = now`. Returns the number of events resolved.
pub fn expire_stale(store: &AnomalyStore, policy: &ExpiryPolicy, now: DateTime<Utc>) -> Result<usize> {
    let mut total = 0;
    for severity in [Severity::Warning, Severity::Critical] {
        let n = store.resolve_older_than(severity, now - policy.ttl(severity), now)?;
        if n > 0 {
            info!(severity = %severity, resolved = n, "Expired stale anomalies");
        }
        total += n;
    }
    Ok(total)
}
