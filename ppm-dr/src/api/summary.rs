//! Area summary and refresh status

use axum::{
    extract::{Query, State},
    Json,
};
use ppm_common::db::models::{CollectionStatus, HealthLabel};
use ppm_common::read::AreaSummary;
use ppm_common::store::SnapshotStats;
use serde::{Deserialize, Serialize};

use super::entities::parse_bounds;
use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SummaryParams {
    pub north: Option<f64>,
    pub south: Option<f64>,
    pub east: Option<f64>,
    pub west: Option<f64>,
}

/// GET /api/summary
pub async fn get_area_summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> ApiResult<Json<AreaSummary>> {
    let bounds = parse_bounds(params.north, params.south, params.east, params.west)?;
    Ok(Json(state.read.area_summary(bounds).await?))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub job_name: String,
    pub backend: String,
    pub health_label: HealthLabel,
    pub needs_refresh: bool,
    pub refresh_age_hours: Option<f64>,
    pub collection_status: Option<CollectionStatus>,
    pub snapshot: SnapshotStats,
    pub snapshot_health_score: f64,
}

/// GET /api/status
///
/// Freshness of the aggregate as readers see it.
pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let config = &state.config;
    let now = ppm_common::time::now();
    let stale_after = config.refresh.stale_after();

    let collection_status = state.status.load(&config.refresh.job_name).await?;
    let snapshot = state
        .read
        .store()
        .snapshot_stats(config.aggregation.healthy_completeness)
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
        job_name: config.refresh.job_name.clone(),
        backend: state.read.store().backend().to_string(),
        health_label,
        needs_refresh,
        refresh_age_hours,
        collection_status,
        snapshot_health_score: snapshot.health_score(now),
        snapshot,
    }))
}
