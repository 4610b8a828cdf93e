//! Shared fixtures for ppm-md integration tests
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use ppm_common::config::AggregationConfig;
use ppm_common::db::init::init_database;
use ppm_common::db::models::NewEntity;
use ppm_common::db::{EntityStore, ObservationStore};
use ppm_common::sources::{
    DemographicReading, EconomicReading, FootTrafficReading, NewObservation, ObservationPayload,
    PredictionReading, SentimentReading, SubjectKey, TrafficReading, WeatherReading,
};
use ppm_common::GeoPoint;
use ppm_md::aggregation::AggregationEngine;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Reference venue E1: downtown Kansas City
pub const E1_LAT: f64 = 39.0997;
pub const E1_LNG: f64 = -94.5786;

pub struct TestDb {
    pub pool: SqlitePool,
    pub entities: EntityStore,
    pub observations: ObservationStore,
    _dir: TempDir,
}

pub async fn setup() -> TestDb {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("ppm.db")).await.unwrap();
    TestDb {
        entities: EntityStore::new(pool.clone()),
        observations: ObservationStore::new(pool.clone()),
        pool,
        _dir: dir,
    }
}

impl TestDb {
    pub fn engine(&self) -> AggregationEngine {
        AggregationEngine::new(
            self.entities.clone(),
            self.observations.clone(),
            &AggregationConfig::default(),
        )
    }

    pub async fn venue(&self, external_id: &str, lat: f64, lng: f64) -> String {
        self.entities
            .upsert(&NewEntity::venue(external_id, "visitkc", &format!("Venue {}", external_id), lat, lng))
            .await
            .unwrap()
    }

    pub async fn e1(&self) -> String {
        self.venue("E1", E1_LAT, E1_LNG).await
    }

    pub async fn record(&self, subject: SubjectKey, observed_at: DateTime<Utc>, payload: ObservationPayload) -> i64 {
        self.observations
            .record(&NewObservation {
                subject,
                observed_at,
                payload,
            })
            .await
            .unwrap()
    }

    /// Raw insert that bypasses ingestion validation
    pub async fn record_raw(&self, source: &str, entity_id: &str, observed_at: DateTime<Utc>, payload: &str) -> i64 {
        sqlx::query(
            "INSERT INTO observations (source, entity_id, observed_at, payload, ingested_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source)
        .bind(entity_id)
        .bind(ppm_common::time::to_storage(&observed_at))
        .bind(payload)
        .bind(ppm_common::time::to_storage(&Utc::now()))
        .execute(&self.pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }
}

/// Fixed reference instant so runs are reproducible
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap()
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    base_time() - Duration::hours(hours)
}

pub fn entity(entity_id: &str) -> SubjectKey {
    SubjectKey::Entity {
        entity_id: entity_id.to_string(),
    }
}

pub fn point(lat: f64, lng: f64) -> SubjectKey {
    SubjectKey::Point { lat, lng }
}

pub fn area(name: &str) -> SubjectKey {
    SubjectKey::Area { name: name.to_string() }
}

/// Square tract of half-width `half` degrees centred on (lat, lng)
pub fn tract(tract_id: &str, lat: f64, lng: f64, half: f64) -> SubjectKey {
    SubjectKey::Tract {
        tract_id: tract_id.to_string(),
        polygon: vec![
            GeoPoint::new(lat - half, lng - half),
            GeoPoint::new(lat - half, lng + half),
            GeoPoint::new(lat + half, lng + half),
            GeoPoint::new(lat + half, lng - half),
        ],
    }
}

pub fn prediction(density: f64) -> ObservationPayload {
    ObservationPayload::Prediction(PredictionReading {
        psychographic_density: density,
        confidence_lower: Some((density - 0.1).max(0.0)),
        confidence_upper: Some((density + 0.1).min(1.0)),
        model_version: Some("v2".to_string()),
    })
}

pub fn sentiment(positive: f64) -> ObservationPayload {
    ObservationPayload::Sentiment(SentimentReading {
        mention_count: 42,
        positive_sentiment: positive,
        negative_sentiment: Some(0.05),
        neutral_sentiment: Some(0.05),
        engagement_score: Some(0.7),
    })
}

pub fn foot_traffic(visitors: i64) -> ObservationPayload {
    ObservationPayload::FootTraffic(FootTrafficReading {
        visitors_count: visitors,
        median_dwell_seconds: Some(1800.0),
        visitors_change_24h: None,
        peak_hour_ratio: None,
    })
}

pub fn traffic(congestion: f64) -> ObservationPayload {
    ObservationPayload::Traffic(TrafficReading {
        congestion_score: congestion,
        travel_time_to_downtown_min: Some(12.0),
        travel_time_index: Some(1.2),
    })
}

pub fn weather(temperature_f: f64) -> ObservationPayload {
    ObservationPayload::Weather(WeatherReading {
        temperature_f,
        feels_like_f: None,
        humidity: Some(0.4),
        rain_probability: Some(0.1),
        condition: Some("clear".to_string()),
    })
}

pub fn demographic(median_income: f64) -> ObservationPayload {
    ObservationPayload::Demographic(DemographicReading {
        median_income: Some(median_income),
        pct_bachelors: Some(0.45),
        pct_age_20_40: Some(0.38),
        population_density: Some(5200.0),
    })
}

pub fn economic(unemployment_rate: f64) -> ObservationPayload {
    ObservationPayload::Economic(EconomicReading {
        unemployment_rate: Some(unemployment_rate),
        median_household_income: Some(61000.0),
        consumer_confidence: Some(101.5),
        local_spending_index: None,
    })
}
