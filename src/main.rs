use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use pipewatch::config::PipewatchConfig;
use pipewatch::detect::correlation::CascadeCorrelator;
use pipewatch::detect::incident::AnomalyStore;
use pipewatch::detect::resolver::expire_stale;
use pipewatch::ingest::{spawn_workers, Engine};
use pipewatch::metrics::{Component, MetricSample, RawSample};
use pipewatch::query::QueryFacade;
use pipewatch::rollup::Granularity;
use pipewatch::rules::book::RuleBook;
use pipewatch::rules::RuleTable;
use pipewatch::storage::{hours_before, Storage};

#[derive(Parser)]
#[command(
    name = "pipewatch",
    about = "Anomaly detection and cascade correlation for streaming data pipelines",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides PIPEWATCH_CONFIG and the system path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + correlator + resolver)
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Ingest samples from a JSON-lines file ("-" for stdin)
    Ingest {
        #[arg(long)]
        file: PathBuf,
    },

    /// Run one correlation pass now
    Correlate,

    /// Resolve stale open anomalies now
    Expire,

    /// Open anomalies per component
    Status {
        #[arg(long, default_value = "15")]
        minutes: i64,
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Anomaly counts and top metrics
    Summary {
        #[arg(long, default_value = "24")]
        hours: i64,
        #[arg(long)]
        json: bool,
    },

    /// Rollup series and direction for one metric
    Trend {
        #[arg(long)]
        component: Component,
        #[arg(long)]
        metric: String,
        #[arg(long, default_value = "6")]
        hours: i64,
        #[arg(long, default_value = "1m")]
        granularity: Granularity,
        #[arg(long)]
        json: bool,
    },

    /// Cross-component incidents with their chains
    Incidents {
        #[arg(long, default_value = "24")]
        hours: i64,
        #[arg(long)]
        json: bool,
    },

    /// Mark an anomaly resolved
    Resolve { id: Uuid },

    /// Inspect rule tables
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// List the active tiers
    List,

    /// Validate a rule file without loading it
    Validate { file: PathBuf },
}

fn init_tracing(config: &PipewatchConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_storage(config: &PipewatchConfig) -> Result<Storage> {
    config.storage.open()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = PipewatchConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting pipewatch daemon");
            pipewatch::serve(config).await?;
        }
        Commands::Ingest { file } => ingest_file(&config, &file).await?,
        Commands::Correlate => {
            let correlator = CascadeCorrelator::new(
                AnomalyStore::new(open_storage(&config)?.events),
                config.correlator.settings(),
            );
            let incidents = correlator.correlate(Utc::now())?;
            println!("{} new incident(s)", incidents.len());
            for incident in incidents {
                println!(
                    "{} {:<45} confidence {:.2}",
                    incident.id, incident.label, incident.confidence
                );
            }
        }
        Commands::Expire => {
            let store = AnomalyStore::new(open_storage(&config)?.events);
            let resolved = expire_stale(&store, &config.resolver.policy(), Utc::now())?;
            println!("{} anomaly(ies) expired", resolved);
        }
        Commands::Status { minutes, json } => {
            let facade = QueryFacade::new(&open_storage(&config)?, config.rollup.settings());
            let statuses = facade.current_status(minutes, Utc::now())?;
            if json {
                return print_json(&statuses);
            }
            println!("{:<18} | {:>8} | {:>7} | Latest", "Component", "Critical", "Warning");
            println!("{:-<18}-|-{:-<8}-|-{:-<7}-|-{:-<25}", "", "", "", "");
            for s in &statuses {
                let latest = s
                    .latest_anomaly
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<18} | {:>8} | {:>7} | {}",
                    s.component, s.open_critical, s.open_warning, latest
                );
            }
        }
        Commands::Summary { hours, json } => {
            let facade = QueryFacade::new(&open_storage(&config)?, config.rollup.settings());
            let summary = facade.summary(hours, Utc::now())?;
            if json {
                return print_json(&summary);
            }
            println!("\n=== Anomalies, last {} hour(s): {} ===", hours, summary.total);
            for c in &summary.components {
                let mean = c
                    .mean_resolution_secs
                    .map(|s| format!("{:.0}s", s))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<18} critical {:>4}  warning {:>4}  metrics {:>3}  mean resolution {}",
                    c.component, c.critical, c.warning, c.distinct_metrics, mean
                );
            }
            if !summary.top_metrics.is_empty() {
                println!("\nTop metrics:");
                for m in &summary.top_metrics {
                    println!(" - {}/{}: {} ({} critical)", m.component, m.metric, m.anomalies, m.critical);
                }
            }
            println!();
        }
        Commands::Trend {
            component,
            metric,
            hours,
            granularity,
            json,
        } => {
            let facade = QueryFacade::new(&open_storage(&config)?, config.rollup.settings());
            let now = Utc::now();
            let trend = facade.trend(
                component,
                &metric,
                hours_before(now, hours)?,
                now,
                granularity,
                now,
            )?;
            if json {
                return print_json(&trend);
            }
            println!(
                "{}/{} ({}): {:?}, {} bucket(s)",
                trend.component,
                trend.metric,
                trend.granularity,
                trend.direction,
                trend.buckets.len()
            );
            for b in &trend.buckets {
                let marker = if b.provisional { " (provisional)" } else { "" };
                println!(
                    "{}  n={:<5} avg={:<12.3} min={:<12.3} max={:<12.3}{}",
                    b.start.to_rfc3339(),
                    b.count,
                    b.avg,
                    b.min,
                    b.max,
                    marker
                );
            }
        }
        Commands::Incidents { hours, json } => {
            let facade = QueryFacade::new(&open_storage(&config)?, config.rollup.settings());
            let now = Utc::now();
            let incidents = facade.cross_component_incidents(hours_before(now, hours)?, now)?;
            if json {
                return print_json(&incidents);
            }
            if incidents.is_empty() {
                println!("No incidents in the last {} hour(s).", hours);
            }
            for i in &incidents {
                println!(
                    "\n{} {} (confidence {:.2})",
                    i.incident.start.to_rfc3339(),
                    i.incident.label,
                    i.incident.confidence
                );
                for e in &i.events {
                    println!(
                        "   {} {}/{} = {} [{}]",
                        e.timestamp.to_rfc3339(),
                        e.component,
                        e.metric,
                        e.value,
                        e.severity
                    );
                }
            }
        }
        Commands::Resolve { id } => {
            let facade = QueryFacade::new(&open_storage(&config)?, config.rollup.settings());
            if facade.resolve(id, Utc::now())? {
                println!("Anomaly {} resolved.", id);
            } else {
                println!("Anomaly {} was already resolved.", id);
            }
        }
        Commands::Rules { action } => match action {
            RulesAction::List => {
                let table = pipewatch::load_rules(&config)?;
                println!("Rule table version {} ({} tiers)", table.version(), table.len());
                println!("{:<16} | {:<32} | {:<20} | Severity", "Component", "Metric", "Condition");
                println!("{:-<16}-|-{:-<32}-|-{:-<20}-|-{:-<8}", "", "", "", "");
                for tier in table.tiers() {
                    let condition = format!("{} {}", tier.comparison.symbol(), tier.threshold);
                    println!(
                        "{:<16} | {:<32} | {:<20} | {}",
                        tier.component, tier.metric, condition, tier.severity
                    );
                }
            }
            RulesAction::Validate { file } => {
                let table = RuleTable::load(&file)
                    .with_context(|| format!("invalid rule file {}", file.display()))?;
                println!("OK: version {} ({} tiers)", table.version(), table.len());
            }
        },
    }

    Ok(())
}

/// Feed a JSON-lines file through the worker pool. Lines that do not parse
/// or classify are reported and skipped.
async fn ingest_file(config: &PipewatchConfig, file: &std::path::Path) -> Result<()> {
    let storage = open_storage(config)?;
    let rules = Arc::new(RuleBook::new(pipewatch::load_rules(config)?));
    let engine = Engine::new(&storage, rules, config.rollup.settings());
    let (tx, handles) = spawn_workers(engine, config.ingest.workers, config.ingest.queue_depth);

    let reader: Box<dyn BufRead> = if file.as_os_str() == "-" {
        Box::new(std::io::BufReader::new(std::io::stdin()))
    } else {
        let f = std::fs::File::open(file)
            .with_context(|| format!("failed to open {}", file.display()))?;
        Box::new(std::io::BufReader::new(f))
    };

    let (mut queued, mut skipped) = (0usize, 0usize);
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let sample = serde_json::from_str::<RawSample>(&line)
            .map_err(anyhow::Error::from)
            .and_then(|raw| MetricSample::try_from(raw).map_err(anyhow::Error::from));
        match sample {
            Ok(sample) => {
                tx.send(sample)
                    .await
                    .context("ingest workers stopped early")?;
                queued += 1;
            }
            Err(e) => {
                tracing::warn!(line = index + 1, "Skipping sample: {}", e);
                skipped += 1;
            }
        }
    }

    drop(tx);
    for handle in handles {
        handle.await?;
    }
    println!("Ingested {} sample(s), skipped {}.", queued, skipped);
    Ok(())
}
