//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "refreshing" while a cycle is running
    pub status: String,
    /// Module name ("ppm-md")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Error of the last cycle while the job is failing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    // Durable status row, so failures of scheduled cycles show up too
    let last_error = match state.controller.status().await {
        Ok(Some(status)) if status.consecutive_errors > 0 => status
            .status_details
            .as_ref()
            .and_then(|details| details.get("error"))
            .and_then(|e| e.as_str())
            .map(str::to_string),
        Ok(_) => None,
        Err(e) => Some(format!("status unavailable: {}", e)),
    };
    let status = match state.controller.state() {
        crate::refresh::ControllerState::Idle => "ok",
        crate::refresh::ControllerState::Attempting => "refreshing",
    };

    Json(HealthResponse {
        status: status.to_string(),
        module: "ppm-md".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        last_error,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
