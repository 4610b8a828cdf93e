//! ppm-dr library - read-only access to the published aggregate
//!
//! Serves ranked entities, text search, area summaries and refresh status.
//! Nothing here writes; the refresh side lives in ppm-md.

use axum::Router;
use chrono::{DateTime, Utc};
use ppm_common::config::TomlConfig;
use ppm_common::db::StatusStore;
use ppm_common::read::ReadInterface;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod db;
pub mod error;

pub use crate::error::{ApiError, ApiResult};

/// Default listen address
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:5812";

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Cached read interface over the aggregate store
    pub read: Arc<ReadInterface>,
    /// Refresh status rows (read-only connection)
    pub status: StatusStore,
    pub config: Arc<TomlConfig>,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(read: Arc<ReadInterface>, status: StatusStore, config: Arc<TomlConfig>) -> Self {
        Self {
            read,
            status,
            config,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    let api = Router::new()
        .route("/api/entities", get(api::get_ranked_entities))
        .route("/api/entities/search", get(api::search_entities))
        .route("/api/events/upcoming", get(api::get_upcoming_events))
        .route("/api/summary", get(api::get_area_summary))
        .route("/api/status", get(api::get_status));

    Router::new()
        .merge(api)
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
