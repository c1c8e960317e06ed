//! TOML configuration for pipewatch.
//!
//! Every section has compiled-in defaults, so a partial file (or none at
//! all) is valid. The file location comes from `--config`, then the
//! `PIPEWATCH_CONFIG` environment variable, then the system path.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::correlation::CorrelatorSettings;
use crate::detect::resolver::ExpiryPolicy;
use crate::rollup::{Granularity, RollupSettings};
use crate::storage::Storage;

pub const CONFIG_ENV: &str = "PIPEWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/pipewatch/pipewatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipewatchConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipewatchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded pipewatch configuration");
        Ok(config)
    }

    /// Try, in order: `PIPEWATCH_CONFIG`, `/etc/pipewatch/pipewatch.toml`,
    /// compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PIPEWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit path must load; without one fall back to
    /// [`PipewatchConfig::load_or_default`].
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage / server / rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database for samples, anomalies and incidents; parent
    /// directories are created on open.
    pub db_path: PathBuf,
    /// SQLite database for rollup buckets. Defaults to `<stem>-rollups.db`
    /// next to `db_path`.
    pub rollup_db_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/pipewatch/pipewatch.db"),
            rollup_db_path: None,
        }
    }
}

impl StorageConfig {
    pub fn rollup_path(&self) -> PathBuf {
        if let Some(path) = &self.rollup_db_path {
            return path.clone();
        }
        let stem = self
            .db_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pipewatch".to_string());
        self.db_path.with_file_name(format!("{}-rollups.db", stem))
    }

    pub fn open(&self) -> Result<Storage> {
        Storage::open(
            &self.db_path.to_string_lossy(),
            &self.rollup_path().to_string_lossy(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8480".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Rule file to load at startup; the built-in table is used when unset.
    pub path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Rollups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    pub granularities: Vec<Granularity>,
    pub grace_secs: u64,
    pub max_lateness_secs: u64,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            granularities: Granularity::ALL.to_vec(),
            grace_secs: 60,
            max_lateness_secs: 300,
        }
    }
}

impl RollupConfig {
    pub fn settings(&self) -> RollupSettings {
        RollupSettings {
            granularities: self.granularities.clone(),
            grace: secs(self.grace_secs),
            max_lateness: secs(self.max_lateness_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Correlator / resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    pub interval_secs: u64,
    pub window_secs: u64,
    pub max_lag_secs: u64,
    pub exhaustion_bucket_secs: u64,
    pub min_exhaustion_metrics: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            window_secs: 900,
            max_lag_secs: 300,
            exhaustion_bucket_secs: 60,
            min_exhaustion_metrics: 3,
        }
    }
}

impl CorrelatorConfig {
    pub fn settings(&self) -> CorrelatorSettings {
        CorrelatorSettings {
            window: secs(self.window_secs),
            max_lag: secs(self.max_lag_secs),
            exhaustion_bucket: secs(self.exhaustion_bucket_secs.max(1)),
            min_exhaustion_metrics: self.min_exhaustion_metrics,
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub warning_ttl_secs: u64,
    pub critical_ttl_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            warning_ttl_secs: 300,
            critical_ttl_secs: 600,
        }
    }
}

impl ResolverConfig {
    pub fn policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            warning_ttl: secs(self.warning_ttl_secs),
            critical_ttl: secs(self.critical_ttl_secs),
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Ingest / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub workers: usize,
    /// Bound of the sample queue feeding the workers.
    pub queue_depth: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Clamped to ten years.
fn secs(n: u64) -> Duration {
    Duration::seconds(n.min(315_360_000) as i64)
}
