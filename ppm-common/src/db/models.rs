//! Database models

use crate::geo::GeoPoint;
use crate::sources::{
    DemographicReading, EconomicReading, FootTrafficReading, PredictionReading, SentimentReading,
    SourceKind, TrafficReading, WeatherReading,
};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Venue,
    Event,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Venue => "venue",
            EntityKind::Event => "event",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "venue" => Ok(EntityKind::Venue),
            "event" => Ok(EntityKind::Event),
            other => Err(Error::Validation(format!("unknown entity kind '{}'", other))),
        }
    }
}

/// Soft lifecycle; entities are never hard-deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Closed,
    Cancelled,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Closed => "closed",
            EntityStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "active" => Ok(EntityStatus::Active),
            "closed" => Ok(EntityStatus::Closed),
            "cancelled" => Ok(EntityStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown entity status '{}'", other))),
        }
    }
}

/// Canonical venue or event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub kind: EntityKind,
    pub external_id: String,
    pub provider: String,
    pub name: String,
    pub category: Option<String>,
    pub status: EntityStatus,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub address: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Venue name as reported by the event feed
    pub venue_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// `Ok(None)` for an entity without coordinates, `Err` when only one of lat/lng is set
    pub fn coordinates(&self) -> Result<Option<GeoPoint>> {
        coordinates(self.lat, self.lng)
    }
}

pub(crate) fn coordinates(lat: Option<f64>, lng: Option<f64>) -> Result<Option<GeoPoint>> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => {
            let point = GeoPoint::new(lat, lng);
            point.validate()?;
            Ok(Some(point))
        }
        (None, None) => Ok(None),
        (lat, lng) => Err(Error::Validation(format!(
            "lat/lng must be both present or both null (lat={:?}, lng={:?})",
            lat, lng
        ))),
    }
}

/// Entity as delivered for ingestion; `entity_id` is assigned by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntity {
    pub kind: EntityKind,
    pub external_id: String,
    pub provider: String,
    pub name: String,
    pub category: Option<String>,
    pub status: EntityStatus,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub address: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub venue_name: Option<String>,
}

impl NewEntity {
    /// Active venue with coordinates
    pub fn venue(external_id: &str, provider: &str, name: &str, lat: f64, lng: f64) -> Self {
        Self {
            kind: EntityKind::Venue,
            external_id: external_id.to_string(),
            provider: provider.to_string(),
            name: name.to_string(),
            category: None,
            status: EntityStatus::Active,
            lat: Some(lat),
            lng: Some(lng),
            address: None,
            starts_at: None,
            ends_at: None,
            venue_name: None,
        }
    }

    /// Active event starting at `starts_at`
    pub fn event(
        external_id: &str,
        provider: &str,
        name: &str,
        lat: f64,
        lng: f64,
        starts_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: EntityKind::Event,
            starts_at: Some(starts_at),
            ..Self::venue(external_id, provider, name, lat, lng)
        }
    }

    pub fn with_venue_name(mut self, venue_name: &str) -> Self {
        self.venue_name = Some(venue_name.to_string());
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.external_id.trim().is_empty() || self.provider.trim().is_empty() {
            return Err(Error::Validation("external_id and provider are required".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::Validation(format!("entity {}/{} has no name", self.provider, self.external_id)));
        }
        if let (Some(start), Some(end)) = (self.starts_at, self.ends_at) {
            if end < start {
                return Err(Error::Validation(format!(
                    "entity {}/{} ends before it starts",
                    self.provider, self.external_id
                )));
            }
        }
        coordinates(self.lat, self.lng).map(|_| ())
    }
}

/// One joined observation inside an aggregate row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sourced<T> {
    pub observation_id: i64,
    pub observed_at: DateTime<Utc>,
    /// Tract id or area name the observation was keyed by (spatial sources)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_key: Option<String>,
    /// Distance from the entity to the weather station
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(flatten)]
    pub reading: T,
}

/// One materialized row per entity: entity fields, the best observation per
/// source (null when absent), derived scores and the refresh timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub entity_id: String,
    pub kind: EntityKind,
    pub external_id: String,
    pub provider: String,
    pub name: String,
    pub category: Option<String>,
    pub status: EntityStatus,
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Venue an event takes place at, when one could be linked
    pub venue_id: Option<String>,

    pub prediction: Option<Sourced<PredictionReading>>,
    pub sentiment: Option<Sourced<SentimentReading>>,
    pub foot_traffic: Option<Sourced<FootTrafficReading>>,
    pub traffic: Option<Sourced<TrafficReading>>,
    pub weather: Option<Sourced<WeatherReading>>,
    pub demographic: Option<Sourced<DemographicReading>>,
    pub economic: Option<Sourced<EconomicReading>>,

    pub data_completeness_score: f64,
    pub composite_score: f64,
    pub data_source_type: String,
    /// Newest `observed_at` among the joined sources; the recency ranking key
    pub latest_observation_at: Option<DateTime<Utc>>,
    pub last_refreshed: DateTime<Utc>,
}

impl AggregateRow {
    pub fn has_source(&self, source: SourceKind) -> bool {
        match source {
            SourceKind::Prediction => self.prediction.is_some(),
            SourceKind::Sentiment => self.sentiment.is_some(),
            SourceKind::FootTraffic => self.foot_traffic.is_some(),
            SourceKind::Traffic => self.traffic.is_some(),
            SourceKind::Weather => self.weather.is_some(),
            SourceKind::Demographic => self.demographic.is_some(),
            SourceKind::Economic => self.economic.is_some(),
        }
    }

    pub fn present_sources(&self) -> Vec<SourceKind> {
        SourceKind::ALL
            .iter()
            .copied()
            .filter(|source| self.has_source(*source))
            .collect()
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

/// Health label derived from a collection status row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthLabel {
    NeverRun,
    Stale,
    Failing,
    Unhealthy,
    Healthy,
}

/// Consecutive failures above this count mark a job as failing
pub const FAILING_CONSECUTIVE_ERRORS: i64 = 3;
/// Health score below this marks a job as unhealthy
pub const UNHEALTHY_SCORE: f64 = 0.5;

/// Collection/refresh status row, one per named job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub source_name: String,
    pub source_type: String,
    pub last_successful_collection: Option<DateTime<Utc>>,
    pub last_attempted_collection: Option<DateTime<Utc>>,
    pub health_score: f64,
    pub error_count: i64,
    pub consecutive_errors: i64,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub records_last_run: i64,
    pub last_duration_seconds: Option<f64>,
    pub status_details: Option<serde_json::Value>,
}

impl CollectionStatus {
    pub fn refresh_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_successful_collection.map(|ts| now - ts)
    }

    pub fn refresh_age_hours(&self, now: DateTime<Utc>) -> Option<f64> {
        self.refresh_age(now)
            .map(|age| age.num_milliseconds() as f64 / 3_600_000.0)
    }

    /// True when there has never been a successful run or the last one is older than `stale_after`
    pub fn needs_refresh(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.refresh_age(now).map_or(true, |age| age > stale_after)
    }

    pub fn health_label(&self, now: DateTime<Utc>, stale_after: Duration) -> HealthLabel {
        if self.last_successful_collection.is_none() {
            if self.consecutive_errors > FAILING_CONSECUTIVE_ERRORS {
                return HealthLabel::Failing;
            }
            return HealthLabel::NeverRun;
        }
        if self.consecutive_errors > FAILING_CONSECUTIVE_ERRORS {
            HealthLabel::Failing
        } else if self.needs_refresh(now, stale_after) {
            HealthLabel::Stale
        } else if self.health_score < UNHEALTHY_SCORE {
            HealthLabel::Unhealthy
        } else {
            HealthLabel::Healthy
        }
    }
}
