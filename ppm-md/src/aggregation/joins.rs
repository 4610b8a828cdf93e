//! Per-source join rules
//!
//! Every rule picks at most one observation per entity and source:
//! - entity-keyed: `subject = entity_id`, newest `observed_at`, then highest `observation_id`
//! - proximity: within `radius_km`, newest, then nearest, then highest id
//! - polygon membership: tract polygon contains the entity, newest, then
//!   nearest centroid, then highest id
//! - area: exact area-name match if any, else prefix match, then newest, then highest id
//!
//! Selection only looks at subject key and timestamp. A selected observation
//! with a malformed payload is reported by the engine, not skipped here.

use ppm_common::db::StoredObservation;
use ppm_common::geo::{centroid, polygon_contains};
use ppm_common::sources::{JoinRule, SubjectKey};
use ppm_common::{GeoPoint, SourceKind};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Observation chosen for one entity
#[derive(Debug, Clone, PartialEq)]
pub struct Selected<'a> {
    pub observation: &'a StoredObservation,
    pub distance_km: Option<f64>,
    pub matched_key: Option<String>,
}

/// Newest first by timestamp, insertion order as tie-break
fn recency(a: &StoredObservation, b: &StoredObservation) -> Ordering {
    a.observed_at
        .cmp(&b.observed_at)
        .then_with(|| a.observation_id.cmp(&b.observation_id))
}

/// Newest, then nearest, then insertion order
fn recency_then_nearest(a: (&StoredObservation, f64), b: (&StoredObservation, f64)) -> Ordering {
    a.0.observed_at
        .cmp(&b.0.observed_at)
        .then_with(|| b.1.total_cmp(&a.1))
        .then_with(|| a.0.observation_id.cmp(&b.0.observation_id))
}

/// Pre-built lookup for one source's observations
#[derive(Debug)]
pub enum SourceIndex {
    /// Best observation per entity id
    EntityKeyed(HashMap<String, StoredObservation>),
    Proximity {
        observations: Vec<StoredObservation>,
        radius_km: f64,
    },
    PolygonMembership(Vec<StoredObservation>),
    /// Area selection does not depend on the entity, so it is resolved once
    Area(Option<StoredObservation>),
}

impl SourceIndex {
    pub fn build(
        source: SourceKind,
        observations: Vec<StoredObservation>,
        radius_km: f64,
        area: &str,
    ) -> Self {
        match source.join_rule() {
            JoinRule::EntityKeyed => SourceIndex::EntityKeyed(latest_by_entity(observations)),
            JoinRule::Proximity => SourceIndex::Proximity {
                observations,
                radius_km,
            },
            JoinRule::PolygonMembership => SourceIndex::PolygonMembership(observations),
            JoinRule::Area => SourceIndex::Area(area_latest(area, &observations).cloned()),
        }
    }

    pub fn select(&self, entity_id: &str, point: &GeoPoint) -> Option<Selected<'_>> {
        match self {
            SourceIndex::EntityKeyed(best) => best.get(entity_id).map(|observation| Selected {
                observation,
                distance_km: None,
                matched_key: None,
            }),
            SourceIndex::Proximity {
                observations,
                radius_km,
            } => nearest_latest(point, observations, *radius_km),
            SourceIndex::PolygonMembership(observations) => containing_latest(point, observations),
            SourceIndex::Area(best) => best.as_ref().map(|observation| Selected {
                observation,
                distance_km: None,
                matched_key: match &observation.subject {
                    SubjectKey::Area { name } => Some(name.clone()),
                    _ => None,
                },
            }),
        }
    }
}

/// Best entity-keyed observation per entity
pub fn latest_by_entity(observations: Vec<StoredObservation>) -> HashMap<String, StoredObservation> {
    let mut best: HashMap<String, StoredObservation> = HashMap::new();
    for observation in observations {
        let SubjectKey::Entity { entity_id } = &observation.subject else {
            continue;
        };
        match best.get(entity_id) {
            Some(current) if recency(current, &observation) != Ordering::Less => {}
            _ => {
                best.insert(entity_id.clone(), observation);
            }
        }
    }
    best
}

/// Newest observation located within `radius_km` of `origin`
pub fn nearest_latest<'a>(
    origin: &GeoPoint,
    observations: &'a [StoredObservation],
    radius_km: f64,
) -> Option<Selected<'a>> {
    observations
        .iter()
        .filter_map(|observation| match &observation.subject {
            SubjectKey::Point { lat, lng } => {
                let distance = origin.distance_km(&GeoPoint::new(*lat, *lng));
                (distance <= radius_km).then_some((observation, distance))
            }
            _ => None,
        })
        .max_by(|a, b| recency_then_nearest(*a, *b))
        .map(|(observation, distance)| Selected {
            observation,
            distance_km: Some(distance),
            matched_key: None,
        })
}

/// Newest observation whose tract polygon contains `origin`
pub fn containing_latest<'a>(origin: &GeoPoint, observations: &'a [StoredObservation]) -> Option<Selected<'a>> {
    observations
        .iter()
        .filter_map(|observation| match &observation.subject {
            SubjectKey::Tract { polygon, .. } if polygon_contains(polygon, origin) => {
                let distance = centroid(polygon).map_or(f64::MAX, |c| origin.distance_km(&c));
                Some((observation, distance))
            }
            _ => None,
        })
        .max_by(|a, b| recency_then_nearest(*a, *b))
        .map(|(observation, _)| Selected {
            observation,
            distance_km: None,
            matched_key: match &observation.subject {
                SubjectKey::Tract { tract_id, .. } => Some(tract_id.clone()),
                _ => None,
            },
        })
}

/// Newest observation for the configured area: exact name matches win over prefix matches
pub fn area_latest<'a>(area: &str, observations: &'a [StoredObservation]) -> Option<&'a StoredObservation> {
    let wanted = area.trim().to_lowercase();
    let named = |observation: &&'a StoredObservation| match &observation.subject {
        SubjectKey::Area { name } => Some(name.trim().to_lowercase()),
        _ => None,
    };

    let exact = observations
        .iter()
        .filter(|o| named(o).is_some_and(|n| n == wanted))
        .max_by(|a, b| recency(a, b));
    if exact.is_some() {
        return exact;
    }

    observations
        .iter()
        .filter(|o| named(o).is_some_and(|n| n.starts_with(&wanted)))
        .max_by(|a, b| recency(a, b))
}
