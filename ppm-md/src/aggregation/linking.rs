//! Event to venue linking
//!
//! An event links to the venue whose name matches the event's reported venue
//! name (trimmed, case-insensitive). Without a name match it links to the
//! nearest venue closer than [`VENUE_LINK_RADIUS_KM`]. Ties go to the lowest
//! `entity_id`.

use ppm_common::db::models::{AggregateRow, EntityKind};
use ppm_common::GeoPoint;
use std::collections::HashMap;

/// Proximity link radius (100 m)
pub const VENUE_LINK_RADIUS_KM: f64 = 0.1;

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

pub struct VenueLinker {
    by_name: HashMap<String, String>,
    /// Sorted by `entity_id`
    venues: Vec<(String, GeoPoint)>,
}

impl VenueLinker {
    /// Index every venue row
    pub fn new<'a>(rows: impl IntoIterator<Item = &'a AggregateRow>) -> Self {
        let mut venues: Vec<(String, String, GeoPoint)> = rows
            .into_iter()
            .filter(|row| row.kind == EntityKind::Venue)
            .map(|row| (row.entity_id.clone(), name_key(&row.name), row.point()))
            .collect();
        venues.sort_by(|a, b| a.0.cmp(&b.0));

        let mut by_name = HashMap::new();
        for (entity_id, key, _) in &venues {
            if !key.is_empty() {
                by_name.entry(key.clone()).or_insert_with(|| entity_id.clone());
            }
        }

        Self {
            by_name,
            venues: venues.into_iter().map(|(id, _, point)| (id, point)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.venues.is_empty()
    }

    /// Venue for an event at `point` that reported `venue_name`
    pub fn link(&self, venue_name: Option<&str>, point: &GeoPoint) -> Option<String> {
        if let Some(id) = venue_name.and_then(|name| self.by_name.get(&name_key(name))) {
            return Some(id.clone());
        }

        let mut best: Option<(&str, f64)> = None;
        for (entity_id, venue) in &self.venues {
            let distance = point.distance_km(venue);
            if distance >= VENUE_LINK_RADIUS_KM {
                continue;
            }
            if best.map_or(true, |(_, nearest)| distance < nearest) {
                best = Some((entity_id, distance));
            }
        }
        best.map(|(id, _)| id.to_string())
    }
}
