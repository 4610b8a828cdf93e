//! Observation source types
//!
//! Each source type has an explicit payload schema (one variant of
//! [`ObservationPayload`]) and a join rule that decides how its subject key is
//! matched against an entity. Payloads are validated when they enter the
//! observation store and again when they are decoded for aggregation.

use crate::geo::GeoPoint;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source type of an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Prediction,
    Sentiment,
    FootTraffic,
    Traffic,
    Weather,
    Demographic,
    Economic,
}

/// How a source's subject key is matched against an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRule {
    /// `subject_key = entity_id`
    EntityKeyed,
    /// Observation location within a radius of the entity
    Proximity,
    /// Entity inside the observation's polygon
    PolygonMembership,
    /// Named area matched against the configured area name
    Area,
}

impl SourceKind {
    /// Fixed checklist order used for completeness and coverage reporting
    pub const ALL: [SourceKind; 7] = [
        SourceKind::Prediction,
        SourceKind::Sentiment,
        SourceKind::FootTraffic,
        SourceKind::Traffic,
        SourceKind::Weather,
        SourceKind::Demographic,
        SourceKind::Economic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Prediction => "prediction",
            SourceKind::Sentiment => "sentiment",
            SourceKind::FootTraffic => "foot_traffic",
            SourceKind::Traffic => "traffic",
            SourceKind::Weather => "weather",
            SourceKind::Demographic => "demographic",
            SourceKind::Economic => "economic",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| Error::Validation(format!("unknown source type '{}'", raw)))
    }

    pub fn join_rule(&self) -> JoinRule {
        match self {
            SourceKind::Prediction
            | SourceKind::Sentiment
            | SourceKind::FootTraffic
            | SourceKind::Traffic => JoinRule::EntityKeyed,
            SourceKind::Weather => JoinRule::Proximity,
            SourceKind::Demographic => JoinRule::PolygonMembership,
            SourceKind::Economic => JoinRule::Area,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject key of an observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubjectKey {
    Entity { entity_id: String },
    Point { lat: f64, lng: f64 },
    Tract { tract_id: String, polygon: Vec<GeoPoint> },
    Area { name: String },
}

impl SubjectKey {
    pub fn join_rule(&self) -> JoinRule {
        match self {
            SubjectKey::Entity { .. } => JoinRule::EntityKeyed,
            SubjectKey::Point { .. } => JoinRule::Proximity,
            SubjectKey::Tract { .. } => JoinRule::PolygonMembership,
            SubjectKey::Area { .. } => JoinRule::Area,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            SubjectKey::Entity { entity_id } if entity_id.trim().is_empty() => {
                Err(Error::Validation("empty entity_id subject".to_string()))
            }
            SubjectKey::Point { lat, lng } => GeoPoint::new(*lat, *lng).validate(),
            SubjectKey::Tract { tract_id, polygon } => {
                if tract_id.trim().is_empty() {
                    return Err(Error::Validation("empty tract_id".to_string()));
                }
                if polygon.len() < 3 {
                    return Err(Error::Validation(format!(
                        "tract {} polygon has {} vertices, need at least 3",
                        tract_id,
                        polygon.len()
                    )));
                }
                polygon.iter().try_for_each(GeoPoint::validate)
            }
            SubjectKey::Area { name } if name.trim().is_empty() => {
                Err(Error::Validation("empty area name".to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionReading {
    pub psychographic_density: f64,
    pub confidence_lower: Option<f64>,
    pub confidence_upper: Option<f64>,
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    pub mention_count: i64,
    pub positive_sentiment: f64,
    pub negative_sentiment: Option<f64>,
    pub neutral_sentiment: Option<f64>,
    pub engagement_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootTrafficReading {
    pub visitors_count: i64,
    pub median_dwell_seconds: Option<f64>,
    pub visitors_change_24h: Option<f64>,
    pub peak_hour_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficReading {
    pub congestion_score: f64,
    pub travel_time_to_downtown_min: Option<f64>,
    pub travel_time_index: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub temperature_f: f64,
    pub feels_like_f: Option<f64>,
    pub humidity: Option<f64>,
    pub rain_probability: Option<f64>,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemographicReading {
    pub median_income: Option<f64>,
    pub pct_bachelors: Option<f64>,
    pub pct_age_20_40: Option<f64>,
    pub population_density: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicReading {
    pub unemployment_rate: Option<f64>,
    pub median_household_income: Option<f64>,
    pub consumer_confidence: Option<f64>,
    pub local_spending_index: Option<f64>,
}

/// Typed observation payload, one variant per source type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ObservationPayload {
    Prediction(PredictionReading),
    Sentiment(SentimentReading),
    FootTraffic(FootTrafficReading),
    Traffic(TrafficReading),
    Weather(WeatherReading),
    Demographic(DemographicReading),
    Economic(EconomicReading),
}

fn check_finite(field: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::Validation(format!("{} is not finite", field)))
    }
}

fn check_unit(field: &str, value: f64) -> Result<()> {
    check_finite(field, value)?;
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Validation(format!("{} must be within [0, 1], got {}", field, value)))
    }
}

fn check_non_negative(field: &str, value: f64) -> Result<()> {
    check_finite(field, value)?;
    if value >= 0.0 {
        Ok(())
    } else {
        Err(Error::Validation(format!("{} must be >= 0, got {}", field, value)))
    }
}

fn check_opt(field: &str, value: Option<f64>, check: fn(&str, f64) -> Result<()>) -> Result<()> {
    value.map_or(Ok(()), |v| check(field, v))
}

impl ObservationPayload {
    pub fn source(&self) -> SourceKind {
        match self {
            ObservationPayload::Prediction(_) => SourceKind::Prediction,
            ObservationPayload::Sentiment(_) => SourceKind::Sentiment,
            ObservationPayload::FootTraffic(_) => SourceKind::FootTraffic,
            ObservationPayload::Traffic(_) => SourceKind::Traffic,
            ObservationPayload::Weather(_) => SourceKind::Weather,
            ObservationPayload::Demographic(_) => SourceKind::Demographic,
            ObservationPayload::Economic(_) => SourceKind::Economic,
        }
    }

    /// Range and finiteness checks for every numeric field
    pub fn validate(&self) -> Result<()> {
        match self {
            ObservationPayload::Prediction(p) => {
                check_unit("psychographic_density", p.psychographic_density)?;
                check_opt("confidence_lower", p.confidence_lower, check_unit)?;
                check_opt("confidence_upper", p.confidence_upper, check_unit)?;
                if let (Some(lo), Some(hi)) = (p.confidence_lower, p.confidence_upper) {
                    if lo > hi {
                        return Err(Error::Validation(format!(
                            "confidence_lower {} exceeds confidence_upper {}",
                            lo, hi
                        )));
                    }
                }
                Ok(())
            }
            ObservationPayload::Sentiment(s) => {
                if s.mention_count < 0 {
                    return Err(Error::Validation("mention_count must be >= 0".to_string()));
                }
                check_unit("positive_sentiment", s.positive_sentiment)?;
                check_opt("negative_sentiment", s.negative_sentiment, check_unit)?;
                check_opt("neutral_sentiment", s.neutral_sentiment, check_unit)?;
                check_opt("engagement_score", s.engagement_score, check_non_negative)
            }
            ObservationPayload::FootTraffic(f) => {
                if f.visitors_count < 0 {
                    return Err(Error::Validation("visitors_count must be >= 0".to_string()));
                }
                check_opt("median_dwell_seconds", f.median_dwell_seconds, check_non_negative)?;
                check_opt("visitors_change_24h", f.visitors_change_24h, check_finite)?;
                check_opt("peak_hour_ratio", f.peak_hour_ratio, check_non_negative)
            }
            ObservationPayload::Traffic(t) => {
                check_unit("congestion_score", t.congestion_score)?;
                check_opt("travel_time_to_downtown_min", t.travel_time_to_downtown_min, check_non_negative)?;
                check_opt("travel_time_index", t.travel_time_index, check_non_negative)
            }
            ObservationPayload::Weather(w) => {
                check_finite("temperature_f", w.temperature_f)?;
                check_opt("feels_like_f", w.feels_like_f, check_finite)?;
                check_opt("rain_probability", w.rain_probability, check_unit)?;
                if let Some(h) = w.humidity {
                    check_finite("humidity", h)?;
                    if !(0.0..=100.0).contains(&h) {
                        return Err(Error::Validation(format!("humidity must be within [0, 100], got {}", h)));
                    }
                }
                Ok(())
            }
            ObservationPayload::Demographic(d) => {
                check_opt("median_income", d.median_income, check_non_negative)?;
                check_opt("pct_bachelors", d.pct_bachelors, check_unit)?;
                check_opt("pct_age_20_40", d.pct_age_20_40, check_unit)?;
                check_opt("population_density", d.population_density, check_non_negative)
            }
            ObservationPayload::Economic(e) => {
                check_opt("unemployment_rate", e.unemployment_rate, check_unit)?;
                check_opt("median_household_income", e.median_household_income, check_non_negative)?;
                check_opt("consumer_confidence", e.consumer_confidence, check_finite)?;
                check_opt("local_spending_index", e.local_spending_index, check_finite)
            }
        }
    }

    /// Decode a stored payload, checking that it matches the source column
    pub fn decode(source: SourceKind, raw: &str) -> Result<Self> {
        let payload: ObservationPayload = serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("undecodable {} payload: {}", source, e)))?;
        if payload.source() != source {
            return Err(Error::Validation(format!(
                "payload tagged {} stored under {}",
                payload.source(),
                source
            )));
        }
        payload.validate()?;
        Ok(payload)
    }
}

/// Extracts a source's reading from the payload union
pub trait SourceReading: Sized {
    const SOURCE: SourceKind;
    fn from_payload(payload: ObservationPayload) -> Option<Self>;
}

macro_rules! source_reading {
    ($reading:ty, $variant:ident) => {
        impl SourceReading for $reading {
            const SOURCE: SourceKind = SourceKind::$variant;

            fn from_payload(payload: ObservationPayload) -> Option<Self> {
                match payload {
                    ObservationPayload::$variant(reading) => Some(reading),
                    _ => None,
                }
            }
        }
    };
}

source_reading!(PredictionReading, Prediction);
source_reading!(SentimentReading, Sentiment);
source_reading!(FootTrafficReading, FootTraffic);
source_reading!(TrafficReading, Traffic);
source_reading!(WeatherReading, Weather);
source_reading!(DemographicReading, Demographic);
source_reading!(EconomicReading, Economic);

/// Observation as delivered by a source adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObservation {
    pub subject: SubjectKey,
    pub observed_at: chrono::DateTime<chrono::Utc>,
    pub payload: ObservationPayload,
}

impl NewObservation {
    /// Ingestion check: payload ranges plus a subject key matching the source's join rule
    pub fn validate(&self) -> Result<()> {
        let source = self.payload.source();
        if self.subject.join_rule() != source.join_rule() {
            return Err(Error::Validation(format!(
                "{} observations need a {:?} subject, got {:?}",
                source,
                source.join_rule(),
                self.subject.join_rule()
            )));
        }
        self.subject.validate()?;
        self.payload.validate()
    }
}
