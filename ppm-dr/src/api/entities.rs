//! Ranked entity reads and text search
//!
//! - `GET /api/entities`: ranked by completeness, composite, recency
//! - `GET /api/entities/search?q=`: name matches before category matches
//! - `GET /api/events/upcoming?days=`: active events starting within `days`

use axum::{
    extract::{Query, State},
    Json,
};
use ppm_common::db::models::{AggregateRow, EntityKind};
use chrono::{DateTime, Duration, DurationRound, Utc};
use ppm_common::read::{RankedQuery, SearchHit, UPCOMING_EVENT_DAYS};
use ppm_common::Bounds;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Query parameters for ranked reads
#[derive(Debug, Default, Deserialize)]
pub struct EntitiesParams {
    pub north: Option<f64>,
    pub south: Option<f64>,
    pub east: Option<f64>,
    pub west: Option<f64>,
    pub category: Option<String>,
    /// "venue" or "event"
    pub kind: Option<EntityKind>,
    pub min_completeness: Option<f64>,
    pub min_composite: Option<f64>,
    /// RFC 3339; inclusive
    pub starts_from: Option<DateTime<Utc>>,
    /// RFC 3339; exclusive
    pub starts_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_only: bool,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EntitiesResponse {
    pub count: usize,
    pub entities: Vec<AggregateRow>,
}

/// GET /api/entities
pub async fn get_ranked_entities(
    State(state): State<AppState>,
    Query(params): Query<EntitiesParams>,
) -> ApiResult<Json<EntitiesResponse>> {
    let query = RankedQuery {
        bounds: parse_bounds(params.north, params.south, params.east, params.west)?,
        category: params.category,
        kind: params.kind,
        min_completeness: params.min_completeness,
        min_composite: params.min_composite,
        starts_from: params.starts_from,
        starts_before: params.starts_before,
        exclude_inactive: params.active_only,
        limit: params.limit,
    };

    let entities = state.read.get_ranked_entities(&query).await?;
    Ok(Json(EntitiesResponse {
        count: entities.len(),
        entities,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpcomingParams {
    pub days: Option<i64>,
    pub limit: Option<i64>,
}

/// GET /api/events/upcoming
///
/// The window opens at the current minute so repeated calls share a cache entry.
pub async fn get_upcoming_events(
    State(state): State<AppState>,
    Query(params): Query<UpcomingParams>,
) -> ApiResult<Json<EntitiesResponse>> {
    let days = params.days.unwrap_or(UPCOMING_EVENT_DAYS);
    if days <= 0 {
        return Err(ApiError::BadRequest(format!("days must be > 0, got {}", days)));
    }

    let now = ppm_common::time::now();
    let window_start = now.duration_trunc(Duration::minutes(1)).unwrap_or(now);
    let query = RankedQuery {
        limit: params.limit,
        ..RankedQuery::upcoming_events(window_start, days)
    };
    let entities = state.read.get_ranked_entities(&query).await?;
    Ok(Json(EntitiesResponse {
        count: entities.len(),
        entities,
    }))
}

/// Query parameters for text search
#[derive(Debug, Deserialize)]
pub struct SearchParams {
    /// Matched case-insensitively against name, then category
    pub q: String,
    pub north: Option<f64>,
    pub south: Option<f64>,
    pub east: Option<f64>,
    pub west: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub count: usize,
    pub results: Vec<SearchHit>,
}

/// GET /api/entities/search?q=
pub async fn search_entities(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let bounds = parse_bounds(params.north, params.south, params.east, params.west)?;
    let results = state
        .read
        .search_entities(&params.q, bounds, params.limit)
        .await?;

    Ok(Json(SearchResponse {
        query: params.q,
        count: results.len(),
        results,
    }))
}

/// All four edges or none
pub fn parse_bounds(
    north: Option<f64>,
    south: Option<f64>,
    east: Option<f64>,
    west: Option<f64>,
) -> ApiResult<Option<Bounds>> {
    match (north, south, east, west) {
        (Some(north), Some(south), Some(east), Some(west)) => {
            Ok(Some(Bounds::new(north, south, east, west)?))
        }
        (None, None, None, None) => Ok(None),
        _ => Err(ApiError::BadRequest(
            "bounds require all of north, south, east and west".to_string(),
        )),
    }
}
