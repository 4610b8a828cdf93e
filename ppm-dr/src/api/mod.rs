//! HTTP API handlers for ppm-dr

pub mod entities;
pub mod health;
pub mod summary;

pub use entities::{get_ranked_entities, get_upcoming_events, search_entities};
pub use health::health_routes;
pub use summary::{get_area_summary, get_status};
