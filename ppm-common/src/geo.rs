//! Geographic helpers used by the spatial joins and read filters

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// WGS84 point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Reject non-finite or out-of-range coordinates
    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::Validation(format!("latitude out of range: {}", self.lat)));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(Error::Validation(format!("longitude out of range: {}", self.lng)));
        }
        Ok(())
    }

    /// Great-circle distance in kilometres (haversine)
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Rectangular lat/lng bounding box (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Bounds {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Result<Self> {
        let bounds = Self { north, south, east, west };
        bounds.validate()?;
        Ok(bounds)
    }

    /// Default metro bounding box (Kansas City)
    pub fn kansas_city() -> Self {
        Self {
            north: 39.3,
            south: 38.9,
            east: -94.3,
            west: -94.8,
        }
    }

    pub fn validate(&self) -> Result<()> {
        GeoPoint::new(self.north, self.east).validate()?;
        GeoPoint::new(self.south, self.west).validate()?;
        if self.south > self.north {
            return Err(Error::InvalidInput(format!(
                "bounds south ({}) is above north ({})",
                self.south, self.north
            )));
        }
        // Antimeridian-crossing boxes are not supported
        if self.west > self.east {
            return Err(Error::InvalidInput(format!(
                "bounds west ({}) is east of east ({})",
                self.west, self.east
            )));
        }
        Ok(())
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.south..=self.north).contains(&point.lat) && (self.west..=self.east).contains(&point.lng)
    }
}

/// Ray-casting point-in-polygon test. The ring may be open or closed.
pub fn polygon_contains(ring: &[GeoPoint], point: &GeoPoint) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (a, b) = (ring[i], ring[j]);
        if (a.lat > point.lat) != (b.lat > point.lat) {
            let cross_lng = (b.lng - a.lng) * (point.lat - a.lat) / (b.lat - a.lat) + a.lng;
            if point.lng < cross_lng {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Vertex centroid, used for tie-breaking between overlapping tracts
pub fn centroid(ring: &[GeoPoint]) -> Option<GeoPoint> {
    if ring.is_empty() {
        return None;
    }
    let n = ring.len() as f64;
    let (lat, lng) = ring
        .iter()
        .fold((0.0, 0.0), |(lat, lng), p| (lat + p.lat, lng + p.lng));
    Some(GeoPoint::new(lat / n, lng / n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(lat: f64, lng: f64, half: f64) -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(lat - half, lng - half),
            GeoPoint::new(lat - half, lng + half),
            GeoPoint::new(lat + half, lng + half),
            GeoPoint::new(lat + half, lng - half),
        ]
    }

    #[test]
    fn test_distance_zero_for_same_point() {
        let p = GeoPoint::new(39.0997, -94.5786);
        assert!(p.distance_km(&p) < 1e-9);
    }

    #[test]
    fn test_distance_downtown_to_plaza() {
        // Downtown KC to Country Club Plaza is roughly 6 km
        let downtown = GeoPoint::new(39.0997, -94.5786);
        let plaza = GeoPoint::new(39.0425, -94.5913);
        let d = downtown.distance_km(&plaza);
        assert!(d > 5.5 && d < 7.0, "got {}", d);
    }

    #[test]
    fn test_point_validation() {
        assert!(GeoPoint::new(39.1, -94.5).validate().is_ok());
        assert!(GeoPoint::new(91.0, 0.0).validate().is_err());
        assert!(GeoPoint::new(0.0, f64::NAN).validate().is_err());
    }

    #[test]
    fn test_bounds_contains_edges() {
        let kc = Bounds::kansas_city();
        assert!(kc.contains(&GeoPoint::new(39.1, -94.5)));
        assert!(kc.contains(&GeoPoint::new(39.3, -94.8)));
        assert!(!kc.contains(&GeoPoint::new(40.0, -94.5)));
    }

    #[test]
    fn test_bounds_rejects_inverted() {
        assert!(Bounds::new(38.0, 39.0, -94.0, -95.0).is_err());
        assert!(Bounds::new(39.0, 38.0, -95.0, -94.0).is_err());
    }

    #[test]
    fn test_polygon_contains() {
        let ring = square(39.1, -94.6, 0.05);
        assert!(polygon_contains(&ring, &GeoPoint::new(39.1, -94.6)));
        assert!(!polygon_contains(&ring, &GeoPoint::new(39.2, -94.6)));
        assert!(!polygon_contains(&ring[..2], &GeoPoint::new(39.1, -94.6)));
    }

    #[test]
    fn test_centroid() {
        let c = centroid(&square(39.1, -94.6, 0.05)).unwrap();
        assert!((c.lat - 39.1).abs() < 1e-9);
        assert!((c.lng + 94.6).abs() < 1e-9);
        assert!(centroid(&[]).is_none());
    }
}
