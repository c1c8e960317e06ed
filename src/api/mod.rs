//! API layer -- axum routes, handlers, and middleware.

mod routes;
pub mod state;

use self::state::AppState;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::incident::AnomalyStore;
    use crate::detect::{AnomalyEvent, Severity};
    use crate::ingest::Engine;
    use crate::metrics::Component;
    use crate::query::QueryFacade;
    use crate::rollup::RollupSettings;
    use crate::rules::book::RuleBook;
    use crate::rules::defaults::builtin_table;
    use crate::storage::{test_storage, Storage};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app() -> (tempfile::TempDir, Storage, Router) {
        let (dir, storage) = test_storage();
        let state = AppState {
            engine: Engine::new(
                &storage,
                Arc::new(RuleBook::new(builtin_table())),
                RollupSettings::default(),
            ),
            facade: QueryFacade::new(&storage, RollupSettings::default()),
        };
        (dir, storage, router(state))
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_wraps_data_and_meta() {
        let (_dir, _storage, app) = app();
        let (status, body) = call(app, get("/api/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["rules_version"], "builtin-1");
        assert!(body["meta"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_post_sample_detects_and_lists_status() {
        let (_dir, _storage, app) = app();
        let sample = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "component": "broker",
            "metric": "consumer_lag",
            "value": 150000.0,
            "host": "broker-01"
        });
        let (status, body) = call(app.clone(), post_json("/api/v1/samples", sample)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["meta"]["accepted"], 1);
        assert!(body["data"][0]["anomaly_id"].is_string());

        let (status, body) = call(app, get("/api/v1/status?minutes=15")).await;
        assert_eq!(status, StatusCode::OK);
        let broker = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["component"] == "broker")
            .unwrap()
            .clone();
        assert_eq!(broker["open_critical"], 1);
    }

    #[tokio::test]
    async fn test_post_invalid_sample_is_rejected() {
        let (_dir, _storage, app) = app();
        let sample = serde_json::json!({
            "timestamp": "yesterday",
            "component": "broker",
            "metric": "consumer_lag",
            "value": 1.0
        });
        let (status, body) = call(app, post_json("/api/v1/samples", sample)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["meta"]["rejected"], 1);
        assert!(body["data"][0]["error"].is_string());
    }

    #[tokio::test]
    async fn test_resolve_unknown_and_known_events() {
        let (_dir, storage, app) = app();
        let (status, _) = call(
            app.clone(),
            post_json(&format!("/api/v1/anomalies/{}/resolve", Uuid::new_v4()), Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let event = AnomalyEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            component: Component::Broker,
            metric: "consumer_lag".to_string(),
            host: "broker-01".to_string(),
            value: 150000.0,
            severity: Severity::Critical,
            threshold: 100000.0,
            reason: "lag".to_string(),
            duration_estimate_ms: None,
            resolved_at: None,
            cascade_incident_id: None,
            tags: BTreeMap::new(),
        };
        AnomalyStore::new(storage.events).append(&event).unwrap();

        let uri = format!("/api/v1/anomalies/{}/resolve", event.id);
        let (status, body) = call(app.clone(), post_json(&uri, Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["resolved"], true);

        let (_, body) = call(app, post_json(&uri, Value::Null)).await;
        assert_eq!(body["data"]["resolved"], false);
    }

    #[tokio::test]
    async fn test_trend_rejects_unknown_component() {
        let (_dir, _storage, app) = app();
        let (status, body) = call(app, get("/api/v1/trend?component=mainframe&metric=x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_out_of_range_lookback_is_bad_request() {
        let (_dir, _storage, app) = app();
        for uri in [
            "/api/v1/trend?component=broker&metric=consumer_lag&hours=9223372036854775807",
            "/api/v1/incidents?hours=9223372036854775",
            "/api/v1/summary?hours=-3",
            "/api/v1/status?minutes=9223372036854775807",
            "/api/v1/samples/recent?minutes=-1",
        ] {
            let (status, body) = call(app.clone(), get(uri)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(body["error"]["message"].is_string(), "{}", uri);
        }

        let (status, _) = call(app, get("/api/v1/incidents?hours=1")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_falls_back() {
        let (_dir, _storage, app) = app();
        let response = app.oneshot(get("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
