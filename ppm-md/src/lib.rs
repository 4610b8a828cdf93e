//! ppm-md library - master data aggregation and refresh
//!
//! - `aggregation`: joins entities with the latest observation per source and scores them
//! - `refresh`: publishes aggregation output through the store's strategy chain
//! - `scheduler`: periodic skip-if-fresh refresh
//! - `api`: health, manual refresh trigger, status

use axum::Router;
use chrono::{DateTime, Utc};
use ppm_common::config::TomlConfig;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod aggregation;
pub mod api;
pub mod error;
pub mod refresh;
pub mod scheduler;

pub use crate::error::{ApiError, ApiResult};
pub use crate::refresh::{RefreshController, RefreshReport, RefreshStatus};

/// Default listen address
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:5811";

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RefreshController>,
    pub config: Arc<TomlConfig>,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(controller: Arc<RefreshController>, config: Arc<TomlConfig>) -> Self {
        Self {
            controller,
            config,
            startup_time: Utc::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::refresh_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
