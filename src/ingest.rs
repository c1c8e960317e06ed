//! Ingestion pipeline: the single write entry point for samples.
//!
//! A sample is validated, appended to the metric store, then fanned out to
//! the rule evaluator and the rollup engine. The two downstream paths run as
//! independent blocking tasks and share no mutable state; a failure in one
//! never prevents the other, and neither can undo the raw write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::detect::evaluator::RuleEvaluator;
use crate::detect::incident::AnomalyStore;
use crate::detect::AnomalyEvent;
use crate::metrics::store::MetricStore;
use crate::metrics::{MetricSample, RawSample, SampleError};
use crate::rollup::engine::{RollupEngine, RollupReport};
use crate::rollup::RollupSettings;
use crate::rules::book::RuleBook;
use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid sample: {0}")]
    Invalid(#[from] SampleError),
    #[error("failed to store sample: {0:#}")]
    MetricStore(anyhow::Error),
    /// The raw sample is stored; evaluation and/or rollup failed.
    #[error("sample {sample_id} stored but downstream processing failed (anomaly: {anomaly:?}, rollup: {rollup:?})")]
    Degraded {
        sample_id: i64,
        anomaly: Option<String>,
        rollup: Option<String>,
    },
    #[error("ingest task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Outcome of one successful ingest.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub sample_id: i64,
    pub anomaly: Option<AnomalyEvent>,
    pub rollup: RollupReport,
}

struct Inner {
    metrics: MetricStore,
    anomalies: AnomalyStore,
    evaluator: RuleEvaluator,
    rollups: RollupEngine,
    rules: Arc<RuleBook>,
}

impl Inner {
    /// Evaluate and, on a match, append the event with its streak duration.
    fn detect(&self, sample: &MetricSample) -> anyhow::Result<Option<AnomalyEvent>> {
        let Some(mut event) = self.evaluator.evaluate(sample) else {
            return Ok(None);
        };

        let streak_start = self.anomalies.open_streak_start(
            event.component,
            &event.metric,
            &event.host,
            event.timestamp,
        )?;
        event.duration_estimate_ms =
            streak_start.map(|start| (event.timestamp - start).num_milliseconds());

        self.anomalies.append(&event)?;
        info!(
            component = %event.component,
            metric = %event.metric,
            severity = %event.severity,
            value = event.value,
            "Anomaly detected"
        );
        Ok(Some(event))
    }
}

/// Cheap to clone; all clones share the same stores and rule book.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Rollups write to their own database, so a held rollup transaction
    /// never blocks the anomaly append.
    pub fn new(storage: &Storage, rules: Arc<RuleBook>, rollup: RollupSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                metrics: MetricStore::new(storage.events.clone()),
                anomalies: AnomalyStore::new(storage.events.clone()),
                evaluator: RuleEvaluator::new(rules.clone()),
                rollups: RollupEngine::new(storage.rollups.clone(), rollup),
                rules,
            }),
        }
    }

    pub fn rules(&self) -> &Arc<RuleBook> {
        &self.inner.rules
    }

    pub async fn ingest(&self, sample: MetricSample) -> Result<IngestReport, IngestError> {
        self.ingest_at(sample, Utc::now()).await
    }

    /// Convert a wire sample and ingest it.
    pub async fn ingest_raw(&self, raw: RawSample) -> Result<IngestReport, IngestError> {
        let sample = MetricSample::try_from(raw)?;
        self.ingest(sample).await
    }

    /// Ingest with an explicit wall clock; `now` drives arrival time and the
    /// rollup lateness checks.
    pub async fn ingest_at(
        &self,
        sample: MetricSample,
        now: DateTime<Utc>,
    ) -> Result<IngestReport, IngestError> {
        sample.validate()?;
        let sample = Arc::new(sample);

        let sample_id = {
            let inner = self.inner.clone();
            let sample = sample.clone();
            tokio::task::spawn_blocking(move || inner.metrics.append(&sample, now))
                .await?
                .map_err(IngestError::MetricStore)?
        };

        let detect = {
            let inner = self.inner.clone();
            let sample = sample.clone();
            tokio::task::spawn_blocking(move || inner.detect(&sample))
        };
        let rollup = {
            let inner = self.inner.clone();
            let sample = sample.clone();
            tokio::task::spawn_blocking(move || inner.rollups.ingest(&sample, now))
        };
        let (detect, rollup) = tokio::join!(detect, rollup);

        match (detect?, rollup?) {
            (Ok(anomaly), Ok(rollup)) => {
                debug!(
                    sample_id,
                    component = %sample.component,
                    metric = %sample.metric,
                    merged = rollup.merged.len(),
                    sealed = rollup.sealed.len(),
                    "Sample ingested"
                );
                Ok(IngestReport {
                    sample_id,
                    anomaly,
                    rollup,
                })
            }
            (detect, rollup) => {
                let anomaly = detect.err().map(|e| format!("{:#}", e));
                let rollup = rollup.err().map(|e| format!("{:#}", e));
                warn!(
                    sample_id,
                    component = %sample.component,
                    metric = %sample.metric,
                    anomaly_error = ?anomaly,
                    rollup_error = ?rollup,
                    "Sample stored with degraded processing"
                );
                Err(IngestError::Degraded {
                    sample_id,
                    anomaly,
                    rollup,
                })
            }
        }
    }
}

/// Start `workers` tasks draining a bounded queue of `depth` samples.
/// Senders wait when the queue is full; dropping every sender stops the
/// workers once the queue is drained.
pub fn spawn_workers(
    engine: Engine,
    workers: usize,
    depth: usize,
) -> (mpsc::Sender<MetricSample>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel::<MetricSample>(depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let handles = (0..workers.max(1))
        .map(|worker| {
            let engine = engine.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(sample) = next else {
                        break;
                    };
                    if let Err(e) = engine.ingest(sample).await {
                        warn!(worker, "Ingest failed: {}", e);
                    }
                }
                debug!(worker, "Ingest worker stopped");
            })
        })
        .collect();

    info!(workers, depth, "Ingest workers started");
    (tx, handles)
}
