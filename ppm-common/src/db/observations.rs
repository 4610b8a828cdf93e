//! Observation store
//!
//! Append-only time series, one logical stream per source type. Everything
//! entering through [`ObservationStore::record`] is validated; rows written by
//! other tools are re-checked on load and malformed payloads surface as
//! `Err` inside [`StoredObservation::payload`] instead of failing the load.

use crate::geo::GeoPoint;
use crate::sources::{JoinRule, NewObservation, ObservationPayload, SourceKind, SubjectKey};
use crate::time::{parse_storage, to_storage};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// Observation as read back for aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObservation {
    pub observation_id: i64,
    pub source: SourceKind,
    pub subject: SubjectKey,
    pub observed_at: DateTime<Utc>,
    /// Decoded and validated payload, or the reason it could not be
    pub payload: std::result::Result<ObservationPayload, String>,
}

/// Result of loading one source's stream
#[derive(Debug, Default)]
pub struct SourceLoad {
    pub observations: Vec<StoredObservation>,
    /// Rows whose subject key or timestamp could not be read: (observation_id, reason)
    pub unattributable: Vec<(i64, String)>,
}

#[derive(Clone)]
pub struct ObservationStore {
    pool: SqlitePool,
}

impl ObservationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validate and append one observation; returns its `observation_id`
    pub async fn record(&self, observation: &NewObservation) -> Result<i64> {
        let ids = self.record_all(std::slice::from_ref(observation)).await?;
        ids.first()
            .copied()
            .ok_or_else(|| Error::Internal("insert returned no observation id".to_string()))
    }

    /// Record a batch in one transaction; nothing is stored if any item is invalid
    pub async fn record_all(&self, observations: &[NewObservation]) -> Result<Vec<i64>> {
        for observation in observations {
            observation.validate()?;
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(observations.len());
        let ingested_at = to_storage(&crate::time::now());

        for observation in observations {
            let payload = serde_json::to_string(&observation.payload)?;
            let polygon = match &observation.subject {
                SubjectKey::Tract { polygon, .. } => Some(serde_json::to_string(polygon)?),
                _ => None,
            };
            let (entity_id, point, tract_id, area) = match &observation.subject {
                SubjectKey::Entity { entity_id } => (Some(entity_id.as_str()), None, None, None),
                SubjectKey::Point { lat, lng } => (None, Some((*lat, *lng)), None, None),
                SubjectKey::Tract { tract_id, .. } => (None, None, Some(tract_id.as_str()), None),
                SubjectKey::Area { name } => (None, None, None, Some(name.as_str())),
            };

            let result = sqlx::query(
                r#"
                INSERT INTO observations (
                    source, entity_id, lat, lng, tract_id, polygon, area,
                    observed_at, payload, ingested_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(observation.payload.source().as_str())
            .bind(entity_id)
            .bind(point.map(|(lat, _)| lat))
            .bind(point.map(|(_, lng)| lng))
            .bind(tract_id)
            .bind(&polygon)
            .bind(area)
            .bind(to_storage(&observation.observed_at))
            .bind(&payload)
            .bind(&ingested_at)
            .execute(&mut *tx)
            .await?;

            let observation_id = result.last_insert_rowid();
            debug!(observation_id, source = %observation.payload.source(), "Recorded observation");
            ids.push(observation_id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Load every observation of one source type, oldest id first
    pub async fn load_source(&self, source: SourceKind) -> Result<SourceLoad> {
        let rows = sqlx::query(
            r#"
            SELECT observation_id, entity_id, lat, lng, tract_id, polygon, area, observed_at, payload
            FROM observations
            WHERE source = ?
            ORDER BY observation_id
            "#,
        )
        .bind(source.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut load = SourceLoad::default();
        for row in &rows {
            let observation_id: i64 = row.try_get("observation_id")?;
            match observation_from_row(source, row) {
                Ok(observation) => load.observations.push(observation),
                Err(e) => load.unattributable.push((observation_id, e.to_string())),
            }
        }
        Ok(load)
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM observations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn observation_from_row(source: SourceKind, row: &SqliteRow) -> Result<StoredObservation> {
    let observation_id: i64 = row.try_get("observation_id")?;
    let observed_at: String = row.try_get("observed_at")?;
    let payload: String = row.try_get("payload")?;

    let subject = match source.join_rule() {
        JoinRule::EntityKeyed => {
            let entity_id: Option<String> = row.try_get("entity_id")?;
            SubjectKey::Entity {
                entity_id: entity_id.ok_or_else(|| missing_subject(source, "entity_id"))?,
            }
        }
        JoinRule::Proximity => {
            let lat: Option<f64> = row.try_get("lat")?;
            let lng: Option<f64> = row.try_get("lng")?;
            match (lat, lng) {
                (Some(lat), Some(lng)) => SubjectKey::Point { lat, lng },
                _ => return Err(missing_subject(source, "lat/lng")),
            }
        }
        JoinRule::PolygonMembership => {
            let tract_id: Option<String> = row.try_get("tract_id")?;
            let polygon: Option<String> = row.try_get("polygon")?;
            let polygon: Vec<GeoPoint> = serde_json::from_str(
                polygon.as_deref().ok_or_else(|| missing_subject(source, "polygon"))?,
            )?;
            SubjectKey::Tract {
                tract_id: tract_id.ok_or_else(|| missing_subject(source, "tract_id"))?,
                polygon,
            }
        }
        JoinRule::Area => {
            let area: Option<String> = row.try_get("area")?;
            SubjectKey::Area {
                name: area.ok_or_else(|| missing_subject(source, "area"))?,
            }
        }
    };

    Ok(StoredObservation {
        observation_id,
        source,
        subject,
        observed_at: parse_storage(&observed_at)?,
        payload: ObservationPayload::decode(source, &payload).map_err(|e| e.to_string()),
    })
}

fn missing_subject(source: SourceKind, column: &str) -> Error {
    Error::Validation(format!("{} observation has no {}", source, column))
}
