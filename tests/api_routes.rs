/// HTTP surface tests driven through the router without a socket.
mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use common::{maps_config, test_settings, Harness, ScriptedSource};
use rust_lead_extraction::config::PipelineSettings;
use rust_lead_extraction::handlers::{self, AppState};
use rust_lead_extraction::services::EnrichmentProviders;
use rust_lead_extraction::watchdog::Watchdog;

fn app(harness: &Harness) -> Router {
    let watchdog = Arc::new(Watchdog::new(
        harness.pipeline.tracker().clone(),
        harness.queue.clone(),
        test_settings(),
    ));
    let state = Arc::new(AppState {
        pipeline: harness.pipeline.clone(),
        watchdog,
    });
    handlers::api_routes()
        .route("/health", get(handlers::health))
        .route("/api-docs/openapi.json", get(handlers::openapi_json))
        .with_state(state)
}

fn harness() -> Harness {
    harness_with(test_settings())
}

fn harness_with(settings: PipelineSettings) -> Harness {
    Harness::new(
        Arc::new(ScriptedSource::maps(1, 5)),
        EnrichmentProviders::default(),
        settings,
    )
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let response = app(&harness()).oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "rust-lead-extraction");
}

#[tokio::test]
async fn test_start_run_unknown_config() {
    let response = app(&harness())
        .oneshot(post_json(
            "/api/v1/runs",
            json!({ "config_id": Uuid::new_v4() }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_run_then_poll() {
    let harness = harness();
    let config = maps_config(Uuid::new_v4(), 5);
    harness.register(&config);
    let app = app(&harness);

    let response = app
        .clone()
        .oneshot(post_json("/api/v1/runs", json!({ "config_id": config.id })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let created = body_json(response).await;
    assert_eq!(created["status"], "pending");
    assert_eq!(created["target_quantity"], 5);
    assert_eq!(created["created_quantity"], 0);

    let run_id = created["id"].as_str().unwrap().to_string();
    let response = app
        .clone()
        .oneshot(get_request(&format!("/api/v1/runs/{}", run_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let polled = body_json(response).await;
    assert_eq!(polled["id"], run_id.as_str());
    assert_eq!(polled["config_id"], config.id.to_string());

    let response = app
        .oneshot(get_request(&format!("/api/v1/runs/{}/logs", run_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await.is_array());
}

#[tokio::test]
async fn test_second_run_conflicts() {
    let harness = harness_with(PipelineSettings {
        max_active_runs_per_workspace: 1,
        ..test_settings()
    });
    let config = maps_config(Uuid::new_v4(), 5);
    harness.register(&config);
    let app = app(&harness);

    let mut statuses = Vec::new();
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json("/api/v1/runs", json!({ "config_id": config.id })))
            .await
            .unwrap();
        statuses.push(response.status());
    }
    assert_eq!(statuses, vec![StatusCode::ACCEPTED, StatusCode::CONFLICT]);
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let app = app(&harness());
    for uri in [
        format!("/api/v1/runs/{}", Uuid::new_v4()),
        format!("/api/v1/runs/{}/staging", Uuid::new_v4()),
        format!("/api/v1/runs/{}/logs", Uuid::new_v4()),
    ] {
        let response = app.clone().oneshot(get_request(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
    }
}

#[tokio::test]
async fn test_cancel_run() {
    let harness = harness();
    let config = maps_config(Uuid::new_v4(), 5);
    harness.register(&config);
    let app = app(&harness);

    let response = app
        .clone()
        .oneshot(post_json("/api/v1/runs", json!({ "config_id": config.id })))
        .await
        .unwrap();
    let run_id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(post_json(
            &format!("/api/v1/runs/{}/cancel", run_id),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["cancel_requested"], true);
}

#[tokio::test]
async fn test_watchdog_sweep_with_nothing_stale() {
    let response = app(&harness())
        .oneshot(post_json("/api/v1/watchdog/sweep", json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["stale_runs"], 0);
    assert_eq!(body["finalized"], json!([]));
}

#[tokio::test]
async fn test_openapi_document_lists_routes() {
    let response = app(&harness())
        .oneshot(get_request("/api-docs/openapi.json"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    let paths = doc["paths"].as_object().unwrap();
    assert!(paths.contains_key("/api/v1/runs"));
    assert!(paths.contains_key("/api/v1/runs/{id}"));
    assert!(paths.contains_key("/api/v1/watchdog/sweep"));
}
