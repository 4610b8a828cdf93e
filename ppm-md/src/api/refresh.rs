//! Refresh trigger and status endpoints
//!
//! - `POST /refresh`: run one cycle now (409 while another is running)
//! - `GET /status`: collection status row, derived health and snapshot stats

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use ppm_common::db::models::{CollectionStatus, HealthLabel};
use ppm_common::store::{SnapshotStats, StoreCapabilities};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::{ApiError, ApiResult};
use crate::refresh::{ControllerState, RefreshReport};
use crate::AppState;

/// POST /refresh
///
/// Forces a cycle regardless of data age. FAILED cycles are still a 200:
/// the body is the structured report.
///
/// The cycle runs on its own task, so a client that disconnects mid-cycle
/// does not cancel it; the status row is written either way.
pub async fn trigger_refresh(State(state): State<AppState>) -> ApiResult<Json<RefreshReport>> {
    info!("Manual refresh requested");
    let controller = Arc::clone(&state.controller);
    let timeout = state.config.refresh.timeout();

    let report = tokio::spawn(async move { controller.try_refresh(Some(timeout)).await })
        .await
        .map_err(|e| {
            error!(error = %e, "Refresh task did not complete");
            ApiError::Internal(format!("refresh task failed: {}", e))
        })??;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub job_name: String,
    pub state: ControllerState,
    pub backend: String,
    pub capabilities: StoreCapabilities,
    pub strategies: Vec<&'static str>,
    pub health_label: HealthLabel,
    pub needs_refresh: bool,
    pub refresh_age_hours: Option<f64>,
    pub collection_status: Option<CollectionStatus>,
    pub snapshot: SnapshotStats,
    pub snapshot_health_score: f64,
}

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let controller = &state.controller;
    let now = ppm_common::time::now();
    let stale_after = state.config.refresh.stale_after();

    let collection_status = controller.status().await?;
    let snapshot = controller
        .store()
        .snapshot_stats(controller.healthy_completeness())
        .await?;

    let (health_label, needs_refresh, refresh_age_hours) = match &collection_status {
        Some(status) => (
            status.health_label(now, stale_after),
            status.needs_refresh(now, stale_after),
            status.refresh_age_hours(now),
        ),
        None => (HealthLabel::NeverRun, true, None),
    };

    Ok(Json(StatusResponse {
        job_name: controller.job_name().to_string(),
        state: controller.state(),
        backend: controller.store().backend().to_string(),
        capabilities: controller.store().capabilities(),
        strategies: controller.chain().names(),
        health_label,
        needs_refresh,
        refresh_age_hours,
        collection_status,
        snapshot_health_score: snapshot.health_score(now),
        snapshot,
    }))
}

pub fn refresh_routes() -> Router<AppState> {
    Router::new()
        .route("/refresh", post(trigger_refresh))
        .route("/status", get(get_status))
}
