//! Integration tests for ppm-md API endpoints
//!
//! Tests cover:
//! - Health endpoint
//! - Manual refresh trigger (report body, 409 while busy, client disconnect)
//! - Status endpoint (collection status, derived health, snapshot stats)

mod common;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::*;
use ppm_common::config::TomlConfig;
use ppm_common::db::models::AggregateRow;
use ppm_common::read::RankedQuery;
use ppm_common::store::{AggregateStore, SnapshotStats, SqliteStore, StoreCapabilities};
use ppm_md::{build_router, AppState, RefreshController};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt; // for `oneshot` method

/// Store whose transactional publish takes a while
struct SlowStore(SqliteStore);

#[async_trait]
impl AggregateStore for SlowStore {
    fn backend(&self) -> &'static str {
        "slow"
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.0.capabilities()
    }

    async fn replace_all(&self, rows: &[AggregateRow]) -> ppm_common::Result<()> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.0.replace_all(rows).await
    }

    async fn read_ranked(&self, query: &RankedQuery) -> ppm_common::Result<Vec<AggregateRow>> {
        self.0.read_ranked(query).await
    }

    async fn snapshot_stats(&self, healthy_completeness: f64) -> ppm_common::Result<SnapshotStats> {
        self.0.snapshot_stats(healthy_completeness).await
    }
}

/// Test helper: Create app over `store` with default configuration
fn setup_app(db: &TestDb, store: Arc<dyn AggregateStore>) -> (axum::Router, Arc<RefreshController>) {
    let config = TomlConfig::default();
    let controller = Arc::new(RefreshController::from_config(db.pool.clone(), store, &config).unwrap());
    let state = AppState::new(Arc::clone(&controller), Arc::new(config));
    (build_router(state), controller)
}

fn test_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

async fn seed(db: &TestDb) {
    let e1 = db.e1().await;
    db.record(entity(&e1), hours_ago(2), prediction(0.85)).await;
    db.record(entity(&e1), hours_ago(2), sentiment(0.9)).await;
    db.record(point(E1_LAT, E1_LNG), hours_ago(1), weather(65.0)).await;
    db.venue("E2", 39.20, -94.40).await;
}

// =============================================================================
// Health Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let db = setup().await;
    let (app, _) = setup_app(&db, Arc::new(SqliteStore::new(db.pool.clone())));

    let response = app.oneshot(test_request("GET", "/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "ppm-md");
    assert!(body["version"].is_string());
    assert!(body.get("last_error").is_none());
}

// =============================================================================
// Refresh Trigger Tests
// =============================================================================

#[tokio::test]
async fn test_post_refresh_returns_report() {
    let db = setup().await;
    seed(&db).await;
    let (app, _) = setup_app(&db, Arc::new(SqliteStore::new(db.pool.clone())));

    let response = app.oneshot(test_request("POST", "/refresh")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "SUCCESS");
    assert_eq!(body["entity_count"], 2);
    assert_eq!(body["strategy"], "transactional_reinsert");
    assert!((body["avg_completeness"].as_f64().unwrap() - 0.6).abs() < 1e-9);
    assert!(body["duration_seconds"].as_f64().unwrap() >= 0.0);
    assert!(body["cycle_id"].is_string());
}

#[tokio::test]
async fn test_post_refresh_conflicts_while_running() {
    let db = setup().await;
    seed(&db).await;
    let (app, controller) = setup_app(&db, Arc::new(SlowStore(SqliteStore::new(db.pool.clone()))));

    let running = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.refresh().await })
    };
    while controller.state() == ppm_md::refresh::ControllerState::Idle {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let response = app.clone().oneshot(test_request("POST", "/refresh")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "CONFLICT");

    let health = app.oneshot(test_request("GET", "/health")).await.unwrap();
    assert_eq!(extract_json(health.into_body()).await["status"], "refreshing");

    running.await.unwrap();
}

#[tokio::test]
async fn test_dropped_refresh_request_still_completes_cycle() {
    let db = setup().await;
    seed(&db).await;
    let (app, controller) = setup_app(&db, Arc::new(SlowStore(SqliteStore::new(db.pool.clone()))));

    // Client gives up long before the 500ms publish finishes
    let request = app.oneshot(test_request("POST", "/refresh"));
    let outcome = tokio::time::timeout(Duration::from_millis(100), request).await;
    assert!(outcome.is_err(), "request should have been abandoned mid-cycle");

    let mut status = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = controller.status().await.unwrap();
        if status.is_some() {
            break;
        }
    }

    let status = status.expect("cycle should record a status row after the client left");
    assert_eq!(status.successful_runs, 1);
    assert_eq!(status.records_last_run, 2);

    let published = controller.store().read_ranked(&RankedQuery::default()).await.unwrap();
    assert_eq!(published.len(), 2);
}

// =============================================================================
// Status Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_status_before_first_refresh() {
    let db = setup().await;
    let (app, _) = setup_app(&db, Arc::new(SqliteStore::new(db.pool.clone())));

    let response = app.oneshot(test_request("GET", "/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["job_name"], "master_data_refresh");
    assert_eq!(body["state"], "IDLE");
    assert_eq!(body["backend"], "sqlite");
    assert_eq!(body["health_label"], "NeverRun");
    assert_eq!(body["needs_refresh"], true);
    assert!(body["collection_status"].is_null());
    assert_eq!(body["snapshot"]["entity_count"], 0);
}

#[tokio::test]
async fn test_status_after_refresh() {
    let db = setup().await;
    seed(&db).await;
    let (app, _) = setup_app(&db, Arc::new(SqliteStore::new(db.pool.clone())));

    let refresh = app.clone().oneshot(test_request("POST", "/refresh")).await.unwrap();
    assert_eq!(refresh.status(), StatusCode::OK);

    let response = app.oneshot(test_request("GET", "/status")).await.unwrap();
    let body = extract_json(response.into_body()).await;

    assert_eq!(body["needs_refresh"], false);
    assert_eq!(body["strategies"], serde_json::json!(["transactional_reinsert"]));
    assert_eq!(body["collection_status"]["records_last_run"], 2);
    assert_eq!(body["collection_status"]["successful_runs"], 1);
    assert_eq!(body["collection_status"]["health_score"], 0.5);
    assert_eq!(body["snapshot"]["entity_count"], 2);
    assert!(body["refresh_age_hours"].as_f64().unwrap() < 1.0);
}
