//! Aggregation engine
//!
//! Builds one [`AggregateRow`] per located entity from the entity store and
//! the latest matching observation of every source type. The engine only
//! computes rows; publishing them is the refresh controller's job.
//!
//! # Failure isolation
//! - Entity that fails validation (unreadable row, lat without lng): excluded
//!   and listed in [`AggregationRun::invalid_entities`]
//! - Entity without coordinates: skipped, counted
//! - Selected observation with a malformed payload: that source is left null
//!   for that entity and a [`SourceJoinError`] is recorded; every other
//!   source and entity is unaffected
//! - Observation whose subject key cannot be read: ignored, counted
//!
//! Events are linked to a venue row after all rows are built (see [`linking`]).
//!
//! Store read failures are not isolated; they fail the whole run.

pub mod joins;
pub mod linking;
pub mod scoring;

pub use joins::{SourceIndex, Selected};
pub use linking::VenueLinker;
pub use scoring::ScoringPolicy;

use chrono::{DateTime, Utc};
use ppm_common::config::AggregationConfig;
use ppm_common::db::models::{AggregateRow, Entity, EntityKind, Sourced};
use ppm_common::db::{EntityStore, ObservationStore};
use ppm_common::sources::SourceReading;
use ppm_common::{GeoPoint, Result, SourceKind};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// A source that could not be joined for one entity
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{source_type} join failed for entity {entity_id} (observation {observation_id}): {reason}")]
pub struct SourceJoinError {
    pub entity_id: String,
    pub source_type: SourceKind,
    pub observation_id: i64,
    pub reason: String,
}

/// Entity excluded from the aggregate because it failed validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidEntity {
    pub entity_id: String,
    pub reason: String,
}

/// Result of one aggregation pass
#[derive(Debug, Clone, Serialize)]
pub struct AggregationRun {
    /// One row per located, valid entity, ordered by `entity_id`
    pub rows: Vec<AggregateRow>,
    pub join_errors: Vec<SourceJoinError>,
    pub invalid_entities: Vec<InvalidEntity>,
    pub skipped_without_coordinates: usize,
    /// Events linked to a venue row
    pub linked_events: usize,
    /// Observations ignored because their subject key or timestamp was unreadable
    pub unattributable_observations: usize,
    pub refreshed_at: DateTime<Utc>,
}

impl AggregationRun {
    pub fn avg_completeness(&self) -> f64 {
        if self.rows.is_empty() {
            return 0.0;
        }
        self.rows.iter().map(|r| r.data_completeness_score).sum::<f64>() / self.rows.len() as f64
    }
}

pub struct AggregationEngine {
    entities: EntityStore,
    observations: ObservationStore,
    policy: ScoringPolicy,
    weather_radius_km: f64,
    economic_area: String,
}

impl AggregationEngine {
    pub fn new(entities: EntityStore, observations: ObservationStore, config: &AggregationConfig) -> Self {
        Self {
            entities,
            observations,
            policy: ScoringPolicy::from_config(config),
            weather_radius_km: config.weather_radius_km,
            economic_area: config.economic_area.clone(),
        }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Compute the full aggregate stamped with `refreshed_at`
    pub async fn aggregate(&self, refreshed_at: DateTime<Utc>) -> Result<AggregationRun> {
        let entities = self.entities.load_all().await?;

        let mut indexes = BTreeMap::new();
        let mut unattributable_observations = 0;
        for source in SourceKind::ALL {
            let load = self.observations.load_source(source).await?;
            for (observation_id, reason) in &load.unattributable {
                warn!(%source, observation_id, reason = %reason, "Ignoring unattributable observation");
            }
            unattributable_observations += load.unattributable.len();
            debug!(%source, observations = load.observations.len(), "Loaded source stream");

            let index = SourceIndex::build(
                source,
                load.observations,
                self.weather_radius_km,
                &self.economic_area,
            );
            indexes.insert(source, index);
        }

        let mut run = AggregationRun {
            rows: Vec::with_capacity(entities.len()),
            join_errors: Vec::new(),
            invalid_entities: Vec::new(),
            skipped_without_coordinates: 0,
            linked_events: 0,
            unattributable_observations,
            refreshed_at,
        };

        let mut event_venue_names = HashMap::new();
        for (entity_id, loaded) in entities {
            let entity = match loaded {
                Ok(entity) => entity,
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "Excluding unreadable entity");
                    run.invalid_entities.push(InvalidEntity {
                        entity_id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let point = match entity.coordinates() {
                Ok(Some(point)) => point,
                Ok(None) => {
                    debug!(entity_id = %entity_id, "Skipping entity without coordinates");
                    run.skipped_without_coordinates += 1;
                    continue;
                }
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "Excluding entity with invalid coordinates");
                    run.invalid_entities.push(InvalidEntity {
                        entity_id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if entity.kind == EntityKind::Event {
                event_venue_names.insert(entity.entity_id.clone(), entity.venue_name.clone());
            }
            let row = self.build_row(entity, point, &indexes, refreshed_at, &mut run.join_errors);
            run.rows.push(row);
        }

        run.rows.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        run.linked_events = link_events(&mut run.rows, &event_venue_names);

        info!(
            entities = run.rows.len(),
            join_errors = run.join_errors.len(),
            invalid = run.invalid_entities.len(),
            without_coordinates = run.skipped_without_coordinates,
            linked_events = run.linked_events,
            avg_completeness = run.avg_completeness(),
            "Aggregation pass complete"
        );
        Ok(run)
    }

    fn build_row(
        &self,
        entity: Entity,
        point: GeoPoint,
        indexes: &BTreeMap<SourceKind, SourceIndex>,
        refreshed_at: DateTime<Utc>,
        errors: &mut Vec<SourceJoinError>,
    ) -> AggregateRow {
        let id = entity.entity_id.as_str();
        let select = |source: SourceKind| indexes.get(&source).and_then(|index| index.select(id, &point));

        let prediction = resolve(id, select(SourceKind::Prediction), errors);
        let sentiment = resolve(id, select(SourceKind::Sentiment), errors);
        let foot_traffic = resolve(id, select(SourceKind::FootTraffic), errors);
        let traffic = resolve(id, select(SourceKind::Traffic), errors);
        let weather = resolve(id, select(SourceKind::Weather), errors);
        let demographic = resolve(id, select(SourceKind::Demographic), errors);
        let economic = resolve(id, select(SourceKind::Economic), errors);

        let data_source_type = self.policy.provenance(entity.kind, &entity.provider);

        let mut row = AggregateRow {
            entity_id: entity.entity_id,
            kind: entity.kind,
            external_id: entity.external_id,
            provider: entity.provider,
            name: entity.name,
            category: entity.category,
            status: entity.status,
            lat: point.lat,
            lng: point.lng,
            address: entity.address,
            starts_at: entity.starts_at,
            ends_at: entity.ends_at,
            venue_id: None,
            prediction,
            sentiment,
            foot_traffic,
            traffic,
            weather,
            demographic,
            economic,
            data_completeness_score: 0.0,
            composite_score: 0.0,
            data_source_type,
            latest_observation_at: None,
            last_refreshed: refreshed_at,
        };

        row.latest_observation_at = [
            row.prediction.as_ref().map(|s| s.observed_at),
            row.sentiment.as_ref().map(|s| s.observed_at),
            row.foot_traffic.as_ref().map(|s| s.observed_at),
            row.traffic.as_ref().map(|s| s.observed_at),
            row.weather.as_ref().map(|s| s.observed_at),
            row.demographic.as_ref().map(|s| s.observed_at),
            row.economic.as_ref().map(|s| s.observed_at),
        ]
        .into_iter()
        .flatten()
        .max();
        row.data_completeness_score = self.policy.completeness(&row);
        row.composite_score = self.policy.composite(&row);
        row
    }
}

/// Set `venue_id` on every event row that links to a venue; returns the link count
fn link_events(rows: &mut [AggregateRow], venue_names: &HashMap<String, Option<String>>) -> usize {
    if venue_names.is_empty() {
        return 0;
    }
    let linker = VenueLinker::new(rows.iter());
    if linker.is_empty() {
        return 0;
    }

    let mut linked = 0;
    for row in rows.iter_mut().filter(|row| row.kind == EntityKind::Event) {
        let venue_name = venue_names.get(&row.entity_id).and_then(|name| name.as_deref());
        row.venue_id = linker.link(venue_name, &row.point());
        match &row.venue_id {
            Some(venue_id) => {
                debug!(entity_id = %row.entity_id, venue_id = %venue_id, "Linked event to venue");
                linked += 1;
            }
            None => debug!(entity_id = %row.entity_id, "No venue found for event"),
        }
    }
    linked
}

/// Turn a selected observation into a row section, or record why it could not be
fn resolve<T: SourceReading>(
    entity_id: &str,
    selected: Option<Selected<'_>>,
    errors: &mut Vec<SourceJoinError>,
) -> Option<Sourced<T>> {
    let selected = selected?;
    let observation = selected.observation;

    let reading = match &observation.payload {
        Ok(payload) => T::from_payload(payload.clone())
            .ok_or_else(|| format!("payload is {} data", payload.source())),
        Err(reason) => Err(reason.clone()),
    };

    match reading {
        Ok(reading) => Some(Sourced {
            observation_id: observation.observation_id,
            observed_at: observation.observed_at,
            matched_key: selected.matched_key,
            distance_km: selected.distance_km,
            reading,
        }),
        Err(reason) => {
            let error = SourceJoinError {
                entity_id: entity_id.to_string(),
                source_type: T::SOURCE,
                observation_id: observation.observation_id,
                reason,
            };
            warn!(error = %error, "Source join failed, leaving section empty");
            errors.push(error);
            None
        }
    }
}
