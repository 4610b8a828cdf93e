//! Aggregation engine integration tests
//!
//! - Bare entity, high-priority sources, fresh weather
//! - Per-entity, per-source isolation of malformed observations
//! - Monotonic completeness as sources are added
//! - Spatial joins (weather radius, tract polygon, area name)
//! - Invalid and unlocated entities

mod common;

use common::*;
use ppm_common::db::models::{EntityStatus, NewEntity};
use ppm_common::SourceKind;

// =============================================================================
// Completeness tiers and weather selection
// =============================================================================

#[tokio::test]
async fn test_bare_entity_scores_floor() {
    let db = setup().await;
    let e1 = db.e1().await;

    let run = db.engine().aggregate(base_time()).await.unwrap();

    assert_eq!(run.rows.len(), 1);
    let row = &run.rows[0];
    assert_eq!(row.entity_id, e1);
    assert_eq!(row.data_completeness_score, 0.2);
    assert_eq!(row.composite_score, 0.0);
    assert!(row.present_sources().is_empty());
    assert!(row.latest_observation_at.is_none());
    assert_eq!(row.last_refreshed, base_time());
    assert_eq!(row.data_source_type, "scraped_dynamic");
    assert!(run.join_errors.is_empty());
}

#[tokio::test]
async fn test_prediction_and_sentiment_raise_completeness() {
    let db = setup().await;
    let e1 = db.e1().await;
    let observed = hours_ago(2);
    db.record(entity(&e1), observed, prediction(0.85)).await;
    db.record(entity(&e1), observed, sentiment(0.9)).await;

    let run = db.engine().aggregate(base_time()).await.unwrap();
    let row = &run.rows[0];

    assert!(row.data_completeness_score >= 0.8);
    let prediction = row.prediction.as_ref().unwrap();
    let sentiment = row.sentiment.as_ref().unwrap();
    assert_eq!(prediction.reading.psychographic_density, 0.85);
    assert_eq!(sentiment.reading.positive_sentiment, 0.9);

    let expected = 0.6 * 0.85 + 0.3 * 0.9;
    assert!((row.composite_score - expected).abs() < 1e-9);
    assert_eq!(row.latest_observation_at, Some(observed));
}

#[tokio::test]
async fn test_fresh_weather_wins_over_stale() {
    let db = setup().await;
    db.e1().await;
    // Stale reading is closer to the venue, fresh one still inside the 5 km radius
    db.record(point(E1_LAT, E1_LNG), hours_ago(24 * 10), weather(41.0)).await;
    let fresh = db.record(point(E1_LAT + 0.02, E1_LNG), hours_ago(1), weather(68.0)).await;

    let run = db.engine().aggregate(base_time()).await.unwrap();
    let weather = run.rows[0].weather.as_ref().unwrap();

    assert_eq!(weather.observation_id, fresh);
    assert_eq!(weather.reading.temperature_f, 68.0);
    assert!(weather.distance_km.unwrap() < 5.0);
    assert_eq!(run.rows[0].data_completeness_score, 0.6);
}

// =============================================================================
// Isolation
// =============================================================================

#[tokio::test]
async fn test_malformed_observation_is_isolated() {
    let db = setup().await;
    let e1 = db.e1().await;
    let e2 = db.venue("E2", 39.05, -94.59).await;
    for id in [&e1, &e2] {
        db.record(entity(id), hours_ago(3), prediction(0.7)).await;
        db.record(entity(id), hours_ago(3), sentiment(0.6)).await;
        db.record(entity(id), hours_ago(3), traffic(0.4)).await;
    }

    let engine = db.engine();
    let before = engine.aggregate(base_time()).await.unwrap();
    assert_eq!(before.rows.iter().filter(|r| r.data_completeness_score == 1.0).count(), 2);

    // Newer, out-of-range sentiment for E1 only
    let bad = db
        .record_raw(
            "sentiment",
            &e1,
            hours_ago(1),
            r#"{"source":"sentiment","mention_count":-3,"positive_sentiment":2.0}"#,
        )
        .await;

    let after = engine.aggregate(base_time()).await.unwrap();
    let old_e1 = before.rows.iter().find(|r| r.entity_id == e1).unwrap();
    let new_e1 = after.rows.iter().find(|r| r.entity_id == e1).unwrap();

    assert!(new_e1.sentiment.is_none());
    assert_eq!(new_e1.prediction, old_e1.prediction);
    assert_eq!(new_e1.traffic, old_e1.traffic);
    assert!(new_e1.data_completeness_score < old_e1.data_completeness_score);

    // Other entity untouched
    let old_e2 = before.rows.iter().find(|r| r.entity_id == e2).unwrap();
    let new_e2 = after.rows.iter().find(|r| r.entity_id == e2).unwrap();
    assert_eq!(old_e2, new_e2);

    assert_eq!(after.join_errors.len(), 1);
    let error = &after.join_errors[0];
    assert_eq!(error.entity_id, e1);
    assert_eq!(error.source_type, SourceKind::Sentiment);
    assert_eq!(error.observation_id, bad);
}

#[tokio::test]
async fn test_unparseable_payload_is_a_join_error() {
    let db = setup().await;
    let e1 = db.e1().await;
    db.record(entity(&e1), hours_ago(4), traffic(0.3)).await;
    db.record_raw("prediction", &e1, hours_ago(1), "{not json").await;

    let run = db.engine().aggregate(base_time()).await.unwrap();
    let row = &run.rows[0];

    assert!(row.prediction.is_none());
    assert!(row.traffic.is_some());
    assert_eq!(run.join_errors.len(), 1);
    assert_eq!(run.join_errors[0].source_type, SourceKind::Prediction);
}

// =============================================================================
// Monotonic completeness
// =============================================================================

#[tokio::test]
async fn test_completeness_never_decreases_as_sources_arrive() {
    let db = setup().await;
    let e1 = db.e1().await;
    let engine = db.engine();

    let mut last = engine.aggregate(base_time()).await.unwrap().rows[0].data_completeness_score;

    let steps = vec![
        (point(E1_LAT, E1_LNG), weather(70.0)),
        (entity(&e1), foot_traffic(250)),
        (entity(&e1), sentiment(0.8)),
        (entity(&e1), traffic(0.2)),
        (entity(&e1), prediction(0.5)),
        (area("Kansas City"), economic(0.04)),
        (tract("29095000100", E1_LAT, E1_LNG, 0.05), demographic(58000.0)),
    ];

    for (subject, payload) in steps {
        db.record(subject, hours_ago(1), payload).await;
        let score = engine.aggregate(base_time()).await.unwrap().rows[0].data_completeness_score;
        assert!(score >= last, "completeness dropped from {} to {}", last, score);
        last = score;
    }
    assert_eq!(last, 1.0);
}

// =============================================================================
// Join rules
// =============================================================================

#[tokio::test]
async fn test_entity_keyed_latest_and_tie_break() {
    let db = setup().await;
    let e1 = db.e1().await;
    db.record(entity(&e1), hours_ago(5), prediction(0.1)).await;
    db.record(entity(&e1), hours_ago(1), prediction(0.2)).await;
    let winner = db.record(entity(&e1), hours_ago(1), prediction(0.3)).await;

    let run = db.engine().aggregate(base_time()).await.unwrap();
    let prediction = run.rows[0].prediction.as_ref().unwrap();
    assert_eq!(prediction.observation_id, winner);
    assert_eq!(prediction.reading.psychographic_density, 0.3);
}

#[tokio::test]
async fn test_weather_outside_radius_is_ignored() {
    let db = setup().await;
    db.e1().await;
    // Lawrence, KS: ~55 km away
    db.record(point(38.9717, -95.2353), hours_ago(1), weather(60.0)).await;

    let run = db.engine().aggregate(base_time()).await.unwrap();
    assert!(run.rows[0].weather.is_none());
}

#[tokio::test]
async fn test_demographic_tract_contains_entity() {
    let db = setup().await;
    db.e1().await;
    let far = db.venue("far", 38.60, -94.00).await;
    db.record(tract("29095000100", E1_LAT, E1_LNG, 0.05), hours_ago(24), demographic(58000.0))
        .await;

    let run = db.engine().aggregate(base_time()).await.unwrap();
    let near = run.rows.iter().find(|r| r.entity_id != far).unwrap();
    let demographic = near.demographic.as_ref().unwrap();
    assert_eq!(demographic.matched_key.as_deref(), Some("29095000100"));
    assert_eq!(demographic.reading.median_income, Some(58000.0));

    let outside = run.rows.iter().find(|r| r.entity_id == far).unwrap();
    assert!(outside.demographic.is_none());
}

#[tokio::test]
async fn test_economic_area_exact_then_prefix() {
    let db = setup().await;
    db.e1().await;
    db.record(area("Kansas City, MO"), hours_ago(1), economic(0.05)).await;
    db.record(area("St. Louis"), hours_ago(0), economic(0.09)).await;

    let run = db.engine().aggregate(base_time()).await.unwrap();
    let economic = run.rows[0].economic.as_ref().unwrap();
    assert_eq!(economic.matched_key.as_deref(), Some("Kansas City, MO"));

    // An exact match beats a newer prefix match
    db.record(area("Kansas City"), hours_ago(48), common::economic(0.03)).await;
    let run = db.engine().aggregate(base_time()).await.unwrap();
    let economic = run.rows[0].economic.as_ref().unwrap();
    assert_eq!(economic.matched_key.as_deref(), Some("Kansas City"));
    assert_eq!(economic.reading.unemployment_rate, Some(0.03));
}

// =============================================================================
// Entity handling
// =============================================================================

#[tokio::test]
async fn test_entities_without_coordinates_are_skipped() {
    let db = setup().await;
    db.e1().await;
    let mut event = NewEntity::venue("evt-1", "predicthq", "Street Fair", 0.0, 0.0);
    event.kind = ppm_common::db::models::EntityKind::Event;
    event.lat = None;
    event.lng = None;
    db.entities.upsert(&event).await.unwrap();

    let run = db.engine().aggregate(base_time()).await.unwrap();
    assert_eq!(run.rows.len(), 1);
    assert_eq!(run.skipped_without_coordinates, 1);
    assert!(run.invalid_entities.is_empty());
}

#[tokio::test]
async fn test_half_located_entity_is_excluded_with_validation_error() {
    let db = setup().await;
    let e1 = db.e1().await;
    sqlx::query(
        "INSERT INTO entities (entity_id, kind, external_id, provider, name, status, lat, created_at, updated_at) \
         VALUES ('broken', 'venue', 'x-1', 'legacy_import', 'Half Located', 'active', 39.1, ?, ?)",
    )
    .bind(ppm_common::time::to_storage(&base_time()))
    .bind(ppm_common::time::to_storage(&base_time()))
    .execute(&db.pool)
    .await
    .unwrap();

    let run = db.engine().aggregate(base_time()).await.unwrap();
    assert_eq!(run.rows.len(), 1);
    assert_eq!(run.rows[0].entity_id, e1);
    assert_eq!(run.invalid_entities.len(), 1);
    assert_eq!(run.invalid_entities[0].entity_id, "broken");
    assert!(run.invalid_entities[0].reason.contains("lat/lng"));
}

#[tokio::test]
async fn test_status_and_provenance_carried_into_rows() {
    let db = setup().await;
    let e1 = db.e1().await;
    db.entities.set_status(&e1, EntityStatus::Closed).await.unwrap();
    db.entities
        .upsert(&NewEntity::venue("g-1", "google_places", "Corner Cafe", 39.09, -94.58).with_category("cafe"))
        .await
        .unwrap();

    let run = db.engine().aggregate(base_time()).await.unwrap();
    let closed = run.rows.iter().find(|r| r.entity_id == e1).unwrap();
    assert_eq!(closed.status, EntityStatus::Closed);

    let cafe = run.rows.iter().find(|r| r.entity_id != e1).unwrap();
    assert_eq!(cafe.data_source_type, "api_places");
    assert_eq!(cafe.category.as_deref(), Some("cafe"));
}

#[tokio::test]
async fn test_rows_are_ordered_by_entity_id_and_deterministic() {
    let db = setup().await;
    for (i, lat) in [39.01, 39.02, 39.03, 39.04].iter().enumerate() {
        let id = db.venue(&format!("v{}", i), *lat, -94.58).await;
        db.record(entity(&id), hours_ago(i as i64), foot_traffic(100 * i as i64)).await;
    }
    db.record(point(39.02, -94.58), hours_ago(2), weather(55.0)).await;

    let engine = db.engine();
    let first = engine.aggregate(base_time()).await.unwrap();
    let second = engine.aggregate(base_time()).await.unwrap();

    assert_eq!(first.rows, second.rows);
    let ids: Vec<_> = first.rows.iter().map(|r| r.entity_id.clone()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

// =============================================================================
// Event to venue linking
// =============================================================================

#[tokio::test]
async fn test_events_link_to_venues_by_name_then_proximity() {
    let db = setup().await;
    let e1 = db.e1().await;
    // Far from E1, so only the name can link to it
    let midland = db.venue("midland", 39.1500, -94.6500).await;

    let named = NewEntity::event("tm-1", "ticketmaster", "Jazz Night", 39.2000, -94.4000, base_time())
        .with_venue_name("venue e1");
    // ~30 m north of E1, no reported venue name
    let nearby = NewEntity::event("tm-2", "ticketmaster", "Block Party", E1_LAT + 0.0003, E1_LNG, base_time());
    let unknown_name = NewEntity::event("tm-3", "ticketmaster", "Pop-up", 39.1501, -94.6500, base_time())
        .with_venue_name("Somewhere Else");
    let remote = NewEntity::event("tm-4", "ticketmaster", "Farm Tour", 38.9000, -94.3000, base_time());

    let mut ids = Vec::new();
    for event in [named, nearby, unknown_name, remote] {
        ids.push(db.entities.upsert(&event).await.unwrap());
    }

    let run = db.engine().aggregate(base_time()).await.unwrap();
    let venue_of = |id: &str| {
        run.rows
            .iter()
            .find(|r| r.entity_id == id)
            .and_then(|r| r.venue_id.clone())
    };

    assert_eq!(venue_of(&ids[0]), Some(e1.clone()));
    assert_eq!(venue_of(&ids[1]), Some(e1.clone()));
    assert_eq!(venue_of(&ids[2]), Some(midland.clone()), "falls back to proximity");
    assert_eq!(venue_of(&ids[3]), None);
    assert_eq!(venue_of(&e1), None, "venues are never linked");
    assert_eq!(run.linked_events, 3);
}

#[tokio::test]
async fn test_event_times_carried_into_rows() {
    let db = setup().await;
    let mut event = NewEntity::event("tm-9", "ticketmaster", "Royals Opener", E1_LAT, E1_LNG, base_time());
    event.ends_at = Some(base_time() + chrono::Duration::hours(3));
    db.entities.upsert(&event).await.unwrap();

    let run = db.engine().aggregate(base_time()).await.unwrap();
    assert_eq!(run.rows.len(), 1);
    assert_eq!(run.rows[0].starts_at, Some(base_time()));
    assert_eq!(run.rows[0].ends_at, Some(base_time() + chrono::Duration::hours(3)));
    assert_eq!(run.rows[0].venue_id, None);
    assert_eq!(run.linked_events, 0);
}
