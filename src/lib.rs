//! Pipewatch -- threshold anomaly detection, rollups and cross-component
//! cascade correlation for a broker -> stream processor -> analytics store
//! data pipeline.
//!
//! Samples enter through [`ingest::Engine`], land in the metric store and
//! fan out to the rule evaluator and the rollup engine. The cascade
//! correlator runs on its own cadence over the anomaly store, and the
//! [`query::QueryFacade`] serves reads to the API and the CLI.

pub mod api;
pub mod config;
pub mod detect;
pub mod ingest;
pub mod metrics;
pub mod query;
pub mod rollup;
pub mod rules;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::PipewatchConfig;
use crate::detect::correlation::CascadeCorrelator;
use crate::detect::incident::AnomalyStore;
use crate::rules::book::RuleBook;
use crate::rules::defaults::builtin_table;
use crate::rules::RuleTable;

/// Rule table named by the config, or the built-in one.
pub fn load_rules(config: &PipewatchConfig) -> Result<RuleTable> {
    match &config.rules.path {
        Some(path) => RuleTable::load(path)
            .with_context(|| format!("failed to load rules from {}", path.display())),
        None => Ok(builtin_table()),
    }
}

/// Start the pipewatch daemon: API server, correlator and resolver loops.
pub async fn serve(config: PipewatchConfig) -> Result<()> {
    // 1. Storage
    tracing::info!(
        db_path = %config.storage.db_path.display(),
        rollup_db_path = %config.storage.rollup_path().display(),
        "Initializing databases"
    );
    let storage = config.storage.open()?;

    // 2. Rules
    let rules = Arc::new(RuleBook::new(load_rules(&config)?));
    tracing::info!(version = %rules.version(), "Rule table loaded");

    // 3. Engine and read side
    let rollup = config.rollup.settings();
    let engine = ingest::Engine::new(&storage, rules.clone(), rollup.clone());
    let facade = query::QueryFacade::new(&storage, rollup);

    // 4. Background loops
    let correlator = Arc::new(CascadeCorrelator::new(
        AnomalyStore::new(storage.events.clone()),
        config.correlator.settings(),
    ));
    tokio::spawn(scheduler::run_correlation_loop(
        correlator,
        config.correlator.interval(),
    ));

    if config.resolver.enabled {
        tokio::spawn(scheduler::run_resolver_loop(
            AnomalyStore::new(storage.events.clone()),
            config.resolver.policy(),
            config.resolver.interval(),
        ));
    }

    if let Some(path) = config.rules.path.clone() {
        spawn_rule_reload(rules, path);
    }

    // 5. API server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;
    let app = api::router(api::state::AppState { engine, facade });

    tracing::info!(%addr, "Pipewatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(unix)]
fn spawn_rule_reload(rules: Arc<RuleBook>, path: std::path::PathBuf) {
    tokio::spawn(reload_rules_on_hangup(rules, path));
}

#[cfg(not(unix))]
fn spawn_rule_reload(_rules: Arc<RuleBook>, _path: std::path::PathBuf) {}

/// Reload the rule file on SIGHUP. A bad file keeps the current table.
#[cfg(unix)]
async fn reload_rules_on_hangup(rules: Arc<RuleBook>, path: std::path::PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGHUP, rule reload disabled: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        match rules.reload_from(&path) {
            Ok(version) => tracing::info!(%version, "Rule table reloaded"),
            Err(e) => tracing::error!(path = %path.display(), "Rule reload failed: {}", e),
        }
    }
}
