//! API route definitions. Handlers only parse parameters, call the engine
//! or the query facade on the blocking pool, and wrap results.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::state::AppState;
use crate::detect::DetectError;
use crate::ingest::IngestError;
use crate::metrics::{Component, RawSample};
use crate::rollup::Granularity;
use crate::storage::{hours_before, LookbackError};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/summary", get(summary))
        .route("/trend", get(trend))
        .route("/incidents", get(incidents))
        .route("/samples", post(ingest_samples))
        .route("/samples/recent", get(recent_samples))
        .route("/anomalies/{id}/resolve", post(resolve_anomaly))
        .route("/rules", get(rules))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        if let Some(lookback) = e.downcast_ref::<LookbackError>() {
            return Self::bad_request(lookback.to_string());
        }
        match e.downcast_ref::<DetectError>() {
            Some(DetectError::EventNotFound(_)) => Self {
                status: StatusCode::NOT_FOUND,
                message: e.to_string(),
            },
            _ => Self::internal(format!("{:#}", e)),
        }
    }
}

impl From<LookbackError> for ApiError {
    fn from(e: LookbackError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": { "status": self.status.as_u16(), "message": self.message } })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn envelope<T: Serialize>(data: T) -> ApiResult {
    let data = serde_json::to_value(data).map_err(ApiError::internal)?;
    Ok(Json(json!({
        "data": data,
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    })))
}

/// Run a facade call off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)
}

async fn health(State(state): State<AppState>) -> ApiResult {
    envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rules_version": state.engine.rules().version(),
    }))
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    #[serde(default = "default_status_minutes")]
    minutes: i64,
}

fn default_status_minutes() -> i64 {
    15
}

async fn status(State(state): State<AppState>, Query(p): Query<StatusParams>) -> ApiResult {
    let facade = state.facade.clone();
    envelope(blocking(move || facade.current_status(p.minutes, Utc::now())).await?)
}

#[derive(Debug, Deserialize)]
struct HoursParams {
    #[serde(default = "default_hours")]
    hours: i64,
}

fn default_hours() -> i64 {
    24
}

async fn summary(State(state): State<AppState>, Query(p): Query<HoursParams>) -> ApiResult {
    let facade = state.facade.clone();
    envelope(blocking(move || facade.summary(p.hours, Utc::now())).await?)
}

#[derive(Debug, Deserialize)]
struct TrendParams {
    component: String,
    metric: String,
    #[serde(default = "default_trend_hours")]
    hours: i64,
    #[serde(default)]
    granularity: Option<String>,
}

fn default_trend_hours() -> i64 {
    6
}

async fn trend(State(state): State<AppState>, Query(p): Query<TrendParams>) -> ApiResult {
    let component: Component = p
        .component
        .parse()
        .map_err(|e: crate::metrics::SampleError| ApiError::bad_request(e.to_string()))?;
    let granularity = match p.granularity.as_deref() {
        Some(g) => g
            .parse::<Granularity>()
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
        None => Granularity::OneMinute,
    };

    let facade = state.facade.clone();
    let now = Utc::now();
    let from = hours_before(now, p.hours)?;
    envelope(
        blocking(move || facade.trend(component, &p.metric, from, now, granularity, now)).await?,
    )
}

async fn incidents(State(state): State<AppState>, Query(p): Query<HoursParams>) -> ApiResult {
    let facade = state.facade.clone();
    let now = Utc::now();
    let from = hours_before(now, p.hours)?;
    envelope(blocking(move || facade.cross_component_incidents(from, now)).await?)
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    #[serde(default = "default_recent_minutes")]
    minutes: i64,
}

fn default_recent_minutes() -> i64 {
    5
}

async fn recent_samples(State(state): State<AppState>, Query(p): Query<RecentParams>) -> ApiResult {
    let facade = state.facade.clone();
    envelope(blocking(move || facade.recent_samples(p.minutes, Utc::now())).await?)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SampleBatch {
    One(RawSample),
    Many(Vec<RawSample>),
}

#[derive(Debug, Serialize)]
struct SampleOutcome {
    sample_id: Option<i64>,
    anomaly_id: Option<Uuid>,
    error: Option<String>,
}

async fn ingest_samples(State(state): State<AppState>, Json(batch): Json<SampleBatch>) -> Response {
    let raws = match batch {
        SampleBatch::One(raw) => vec![raw],
        SampleBatch::Many(raws) => raws,
    };

    let mut outcomes = Vec::with_capacity(raws.len());
    let mut rejected = 0;
    for raw in raws {
        let outcome = match state.engine.ingest_raw(raw).await {
            Ok(report) => SampleOutcome {
                sample_id: Some(report.sample_id),
                anomaly_id: report.anomaly.map(|a| a.id),
                error: None,
            },
            Err(e) => {
                rejected += 1;
                SampleOutcome {
                    sample_id: match &e {
                        IngestError::Degraded { sample_id, .. } => Some(*sample_id),
                        _ => None,
                    },
                    anomaly_id: None,
                    error: Some(e.to_string()),
                }
            }
        };
        outcomes.push(outcome);
    }

    let status = if rejected == 0 {
        StatusCode::ACCEPTED
    } else if rejected == outcomes.len() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::MULTI_STATUS
    };
    let accepted = outcomes.len() - rejected;
    (
        status,
        Json(json!({
            "data": outcomes,
            "meta": { "accepted": accepted, "rejected": rejected }
        })),
    )
        .into_response()
}

async fn resolve_anomaly(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = Uuid::parse_str(&id).map_err(|e| ApiError::bad_request(format!("invalid id: {}", e)))?;
    let facade = state.facade.clone();
    let resolved = blocking(move || facade.resolve(id, Utc::now())).await?;
    envelope(json!({ "id": id, "resolved": resolved }))
}

async fn rules(State(state): State<AppState>) -> ApiResult {
    let table = state.engine.rules().snapshot();
    envelope(json!({
        "version": table.version(),
        "tiers": table.tiers(),
    }))
}
