//! HTTP API handlers for ppm-md

pub mod health;
pub mod refresh;

pub use health::health_routes;
pub use refresh::{get_status, refresh_routes, trigger_refresh};
