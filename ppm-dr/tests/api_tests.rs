//! Integration tests for ppm-dr API endpoints
//!
//! Tests cover:
//! - Ranked reads: ordering, filters, bounds validation
//! - Event windows: explicit start window, upcoming events, active-only
//! - Text search relevance
//! - Area summary
//! - Refresh status as seen by readers
//! - Health endpoint

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{Duration as ChronoDuration, Utc};
use ppm_common::config::TomlConfig;
use ppm_common::db::models::{AggregateRow, EntityKind, EntityStatus};
use ppm_common::db::{RunRecord, StatusStore};
use ppm_common::read::ReadInterface;
use ppm_common::store::{AggregateStore, SqliteStore};
use ppm_dr::{build_router, AppState};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot` method

/// Writer pool (stands in for ppm-md) plus the read-only app over the same file
struct TestEnv {
    writer: SqliteStore,
    writer_pool: SqlitePool,
    app: axum::Router,
    _dir: TempDir,
}

async fn setup() -> TestEnv {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ppm.db");
    let writer_pool = ppm_common::db::init_database(&path).await.unwrap();

    let reader = ppm_dr::db::connect_readonly(&path).await.unwrap();
    let store: Arc<dyn AggregateStore> = Arc::new(SqliteStore::new(reader.clone()));
    // No caching so every request sees the latest publish
    let read = Arc::new(ReadInterface::new(store, Duration::ZERO, 100));
    let state = AppState::new(read, StatusStore::new(reader), Arc::new(TomlConfig::default()));

    TestEnv {
        writer: SqliteStore::new(writer_pool.clone()),
        writer_pool,
        app: build_router(state),
        _dir: dir,
    }
}

fn row(id: &str, name: &str, completeness: f64, composite: f64) -> AggregateRow {
    AggregateRow {
        entity_id: id.to_string(),
        kind: EntityKind::Venue,
        external_id: id.to_string(),
        provider: "visitkc".to_string(),
        name: name.to_string(),
        category: None,
        status: EntityStatus::Active,
        lat: 39.0997,
        lng: -94.5786,
        address: None,
        starts_at: None,
        ends_at: None,
        venue_id: None,
        prediction: None,
        sentiment: None,
        foot_traffic: None,
        traffic: None,
        weather: None,
        demographic: None,
        economic: None,
        data_completeness_score: completeness,
        composite_score: composite,
        data_source_type: "scraped_dynamic".to_string(),
        latest_observation_at: None,
        last_refreshed: Utc::now(),
    }
}

fn test_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app.clone().oneshot(test_request(uri)).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Should read body");
    (status, serde_json::from_slice(&bytes).expect("Should parse JSON"))
}

fn ids(body: &Value, list: &str) -> Vec<String> {
    body[list]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["entity_id"].as_str().unwrap().to_string())
        .collect()
}

// =============================================================================
// Health Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let env = setup().await;
    let (status, body) = get_json(&env.app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "ppm-dr");
    assert!(body["version"].is_string());
}

// =============================================================================
// Ranked Entity Tests
// =============================================================================

#[tokio::test]
async fn test_min_completeness_filter_returns_highest_first() {
    let env = setup().await;
    env.writer
        .replace_all(&[
            row("mid", "Mid", 0.8, 0.5),
            row("low", "Low", 0.6, 0.9),
            row("full", "Full", 1.0, 0.1),
        ])
        .await
        .unwrap();

    let (status, body) = get_json(&env.app, "/api/entities?min_completeness=0.8").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(ids(&body, "entities"), vec!["full", "mid"]);
}

#[tokio::test]
async fn test_ranking_breaks_ties_by_composite_then_recency() {
    let env = setup().await;
    let now = Utc::now();
    let mut recent = row("recent", "Recent", 0.8, 0.4);
    recent.latest_observation_at = Some(now - ChronoDuration::hours(1));
    let mut older = row("older", "Older", 0.8, 0.4);
    older.latest_observation_at = Some(now - ChronoDuration::hours(30));
    let never = row("never", "Never", 0.8, 0.4);
    let strong = row("strong", "Strong", 0.8, 0.7);
    env.writer.replace_all(&[never, older, strong, recent]).await.unwrap();

    let (_, body) = get_json(&env.app, "/api/entities").await;

    assert_eq!(ids(&body, "entities"), vec!["strong", "recent", "older", "never"]);
}

#[tokio::test]
async fn test_kind_category_and_limit_filters() {
    let env = setup().await;
    let mut concert = row("concert", "Concert", 0.8, 0.6);
    concert.kind = EntityKind::Event;
    concert.starts_at = Some(Utc::now() + ChronoDuration::days(2));
    let mut bar = row("bar", "Bar", 1.0, 0.5);
    bar.category = Some("nightlife".to_string());
    let mut club = row("club", "Club", 0.6, 0.5);
    club.category = Some("nightlife".to_string());
    env.writer.replace_all(&[concert, bar, club]).await.unwrap();

    let (_, events) = get_json(&env.app, "/api/entities?kind=event").await;
    assert_eq!(ids(&events, "entities"), vec!["concert"]);

    let (_, nightlife) = get_json(&env.app, "/api/entities?category=nightlife").await;
    assert_eq!(ids(&nightlife, "entities"), vec!["bar", "club"]);

    let (_, limited) = get_json(&env.app, "/api/entities?limit=1").await;
    assert_eq!(ids(&limited, "entities"), vec!["bar"]);
}

fn event(id: &str, starts_in: ChronoDuration, status: EntityStatus) -> AggregateRow {
    let mut event = row(id, id, 0.8, 0.5);
    event.kind = EntityKind::Event;
    event.status = status;
    event.starts_at = Some(Utc::now() + starts_in);
    event.ends_at = Some(Utc::now() + starts_in + ChronoDuration::hours(2));
    event.venue_id = Some("hall".to_string());
    event
}

#[tokio::test]
async fn test_start_window_and_active_only_params() {
    let env = setup().await;
    env.writer
        .replace_all(&[
            row("hall", "Hall", 0.8, 0.5),
            event("yesterday", ChronoDuration::days(-1), EntityStatus::Active),
            event("soon", ChronoDuration::days(3), EntityStatus::Active),
            event("called_off", ChronoDuration::days(4), EntityStatus::Cancelled),
            event("next_season", ChronoDuration::days(90), EntityStatus::Active),
        ])
        .await
        .unwrap();

    let from = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let before = (Utc::now() + ChronoDuration::days(30)).format("%Y-%m-%dT%H:%M:%SZ");
    let uri = format!("/api/entities?kind=event&starts_from={}&starts_before={}", from, before);
    let (status, body) = get_json(&env.app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body, "entities"), vec!["called_off", "soon"]);
    assert_eq!(body["entities"][1]["venue_id"], "hall");
    assert!(body["entities"][1]["ends_at"].is_string());

    let (_, active) = get_json(&env.app, &format!("{}&active_only=true", uri)).await;
    assert_eq!(ids(&active, "entities"), vec!["soon"]);

    let inverted = format!("/api/entities?starts_from={}&starts_before={}", before, from);
    let (status, body) = get_json(&env.app, &inverted).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_upcoming_events_endpoint() {
    let env = setup().await;
    env.writer
        .replace_all(&[
            row("hall", "Hall", 0.8, 0.5),
            event("yesterday", ChronoDuration::days(-1), EntityStatus::Active),
            event("soon", ChronoDuration::days(3), EntityStatus::Active),
            event("called_off", ChronoDuration::days(4), EntityStatus::Cancelled),
            event("next_season", ChronoDuration::days(90), EntityStatus::Active),
        ])
        .await
        .unwrap();

    let (status, body) = get_json(&env.app, "/api/events/upcoming").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body, "entities"), vec!["soon"]);

    let (_, wide) = get_json(&env.app, "/api/events/upcoming?days=120").await;
    assert_eq!(ids(&wide, "entities"), vec!["next_season", "soon"]);

    let (status, _) = get_json(&env.app, "/api/events/upcoming?days=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bounds_filter() {
    let env = setup().await;
    let downtown = row("downtown", "Downtown", 1.0, 0.5);
    let mut lawrence = row("lawrence", "Lawrence", 1.0, 0.5);
    lawrence.lat = 38.97;
    lawrence.lng = -95.24;
    env.writer.replace_all(&[downtown, lawrence]).await.unwrap();

    let (status, body) =
        get_json(&env.app, "/api/entities?north=39.3&south=38.9&east=-94.3&west=-94.8").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body, "entities"), vec!["downtown"]);
}

#[tokio::test]
async fn test_invalid_queries_are_bad_requests() {
    let env = setup().await;

    let (status, body) = get_json(&env.app, "/api/entities?north=39.3&south=38.9").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, _) = get_json(&env.app, "/api/entities?min_completeness=1.5").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(&env.app, "/api/entities?limit=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_readers_see_each_publish() {
    let env = setup().await;
    env.writer.replace_all(&[row("a", "A", 1.0, 0.5)]).await.unwrap();
    let (_, first) = get_json(&env.app, "/api/entities").await;
    assert_eq!(first["count"], 1);

    env.writer
        .replace_all(&[row("a", "A", 1.0, 0.5), row("b", "B", 0.8, 0.5)])
        .await
        .unwrap();
    let (_, second) = get_json(&env.app, "/api/entities").await;
    assert_eq!(ids(&second, "entities"), vec!["a", "b"]);
}

// =============================================================================
// Search Tests
// =============================================================================

#[tokio::test]
async fn test_search_prefers_name_matches() {
    let env = setup().await;
    let mut by_category = row("cat", "Blue Room", 1.0, 0.9);
    by_category.category = Some("Jazz Club".to_string());
    let by_name = row("name", "Jazz District", 0.6, 0.2);
    let unrelated = row("other", "Arena", 1.0, 1.0);
    env.writer.replace_all(&[by_category, by_name, unrelated]).await.unwrap();

    let (status, body) = get_json(&env.app, "/api/entities/search?q=JAZZ").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query"], "JAZZ");
    assert_eq!(ids(&body, "results"), vec!["name", "cat"]);
    assert_eq!(body["results"][0]["relevance"], 1.0);
    assert_eq!(body["results"][1]["relevance"], 0.8);
}

#[tokio::test]
async fn test_blank_search_is_bad_request() {
    let env = setup().await;
    let (status, _) = get_json(&env.app, "/api/entities/search?q=%20").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// =============================================================================
// Summary and Status Tests
// =============================================================================

#[tokio::test]
async fn test_area_summary() {
    let env = setup().await;
    let mut event = row("e", "Show", 0.6, 0.3);
    event.kind = EntityKind::Event;
    env.writer
        .replace_all(&[row("a", "A", 1.0, 0.5), row("b", "B", 0.2, 0.1), event])
        .await
        .unwrap();

    let (status, body) = get_json(&env.app, "/api/summary").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_entities"], 3);
    assert_eq!(body["venues"], 2);
    assert_eq!(body["events"], 1);
    assert_eq!(body["quality_distribution"], json!({"high": 1, "medium": 1, "low": 1}));
    assert_eq!(body["category_distribution"]["uncategorized"], 3);
    assert!((body["avg_completeness"].as_f64().unwrap() - 0.6).abs() < 1e-9);
}

#[tokio::test]
async fn test_status_before_any_refresh() {
    let env = setup().await;
    let (status, body) = get_json(&env.app, "/api/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_name"], "master_data_refresh");
    assert_eq!(body["backend"], "sqlite");
    assert_eq!(body["health_label"], "NeverRun");
    assert_eq!(body["needs_refresh"], true);
    assert!(body["collection_status"].is_null());
}

#[tokio::test]
async fn test_status_after_refresh() {
    let env = setup().await;
    env.writer
        .replace_all(&[row("a", "A", 1.0, 0.5), row("b", "B", 0.8, 0.5)])
        .await
        .unwrap();
    StatusStore::new(env.writer_pool.clone())
        .record_success(
            "master_data_refresh",
            &RunRecord {
                attempted_at: Utc::now(),
                duration_seconds: 0.4,
                details: json!({"status": "SUCCESS"}),
            },
            1.0,
            2,
        )
        .await
        .unwrap();

    let (_, body) = get_json(&env.app, "/api/status").await;

    assert_eq!(body["health_label"], "Healthy");
    assert_eq!(body["needs_refresh"], false);
    assert_eq!(body["collection_status"]["records_last_run"], 2);
    assert_eq!(body["snapshot"]["entity_count"], 2);
    // 0.9 avg completeness, all high quality, 2 of 100 entities, refreshed just now
    let expected = 0.9 * 0.4 + 1.0 * 0.3 + 0.02 * 0.2 + 1.0 * 0.1;
    assert!((body["snapshot_health_score"].as_f64().unwrap() - expected).abs() < 1e-9);
}
