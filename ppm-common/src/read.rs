//! Read interface over the materialized aggregate
//!
//! Consumers (map builder, HTTP API, CLI) only ever read the published
//! aggregate; nothing here joins live observation data. Results are ordered by
//! the ranking contract: completeness DESC, composite DESC, recency DESC
//! (rows without observations last), then `entity_id` for a stable order.

use crate::db::models::{AggregateRow, EntityKind};
use crate::geo::Bounds;
use crate::sources::SourceKind;
use crate::store::{AggregateStore, HIGH_QUALITY_COMPLETENESS};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Completeness at or above which an entity counts as medium quality
pub const MEDIUM_QUALITY_COMPLETENESS: f64 = 0.6;

/// Default look-ahead for upcoming event reads
pub const UPCOMING_EVENT_DAYS: i64 = 30;

const NAME_MATCH_RELEVANCE: f64 = 1.0;
const CATEGORY_MATCH_RELEVANCE: f64 = 0.8;

/// `get_ranked_entities` parameters; every filter is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedQuery {
    pub bounds: Option<Bounds>,
    pub category: Option<String>,
    pub kind: Option<EntityKind>,
    pub min_completeness: Option<f64>,
    pub min_composite: Option<f64>,
    /// Timed entities starting at or after this instant; untimed rows (venues) pass
    pub starts_from: Option<DateTime<Utc>>,
    /// Timed entities starting strictly before this instant; untimed rows pass
    pub starts_before: Option<DateTime<Utc>>,
    /// Drop closed venues and cancelled events
    #[serde(default)]
    pub exclude_inactive: bool,
    pub limit: Option<i64>,
}

impl RankedQuery {
    pub fn validate(&self) -> Result<()> {
        if let Some(bounds) = &self.bounds {
            bounds.validate()?;
        }
        if let Some(min) = self.min_completeness {
            if !(0.0..=1.0).contains(&min) {
                return Err(Error::InvalidInput(format!("min_completeness must be within [0, 1], got {}", min)));
            }
        }
        if let Some(min) = self.min_composite {
            if !min.is_finite() {
                return Err(Error::InvalidInput("min_composite must be finite".to_string()));
            }
        }
        if let (Some(from), Some(before)) = (self.starts_from, self.starts_before) {
            if from >= before {
                return Err(Error::InvalidInput(format!(
                    "empty start window: starts_from {} is not before starts_before {}",
                    from, before
                )));
            }
        }
        if let Some(limit) = self.limit {
            if limit <= 0 {
                return Err(Error::InvalidInput(format!("limit must be > 0, got {}", limit)));
            }
        }
        Ok(())
    }

    /// Active events starting within `days` of `now`
    pub fn upcoming_events(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            kind: Some(EntityKind::Event),
            starts_from: Some(now),
            starts_before: Some(now + chrono::Duration::days(days)),
            exclude_inactive: true,
            ..Default::default()
        }
    }

    fn cache_key(&self) -> String {
        // Debug output is stable for identical queries
        format!("{:?}", self)
    }
}

/// The ranking contract as a comparator
pub fn ranking_cmp(a: &AggregateRow, b: &AggregateRow) -> Ordering {
    b.data_completeness_score
        .total_cmp(&a.data_completeness_score)
        .then_with(|| b.composite_score.total_cmp(&a.composite_score))
        .then_with(|| match (&a.latest_observation_at, &b.latest_observation_at) {
            (Some(a), Some(b)) => b.cmp(a),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.entity_id.cmp(&b.entity_id))
}

/// Search hit with its relevance
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub relevance: f64,
    #[serde(flatten)]
    pub entity: AggregateRow,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityDistribution {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Summary of the published aggregate within optional bounds
#[derive(Debug, Clone, Serialize)]
pub struct AreaSummary {
    pub bounds: Option<Bounds>,
    pub total_entities: usize,
    pub venues: usize,
    pub events: usize,
    pub avg_completeness: f64,
    pub avg_composite: f64,
    pub quality_distribution: QualityDistribution,
    pub category_distribution: BTreeMap<String, usize>,
    /// Entities with each source present, in checklist order
    pub source_coverage: BTreeMap<SourceKind, usize>,
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl AreaSummary {
    pub fn from_rows(bounds: Option<Bounds>, rows: &[AggregateRow]) -> Self {
        let mut summary = AreaSummary {
            bounds,
            total_entities: rows.len(),
            venues: 0,
            events: 0,
            avg_completeness: 0.0,
            avg_composite: 0.0,
            quality_distribution: QualityDistribution::default(),
            category_distribution: BTreeMap::new(),
            source_coverage: SourceKind::ALL.iter().map(|s| (*s, 0)).collect(),
            last_refreshed: None,
        };

        for row in rows {
            match row.kind {
                EntityKind::Venue => summary.venues += 1,
                EntityKind::Event => summary.events += 1,
            }
            summary.avg_completeness += row.data_completeness_score;
            summary.avg_composite += row.composite_score;

            if row.data_completeness_score >= HIGH_QUALITY_COMPLETENESS {
                summary.quality_distribution.high += 1;
            } else if row.data_completeness_score >= MEDIUM_QUALITY_COMPLETENESS {
                summary.quality_distribution.medium += 1;
            } else {
                summary.quality_distribution.low += 1;
            }

            let category = row.category.clone().unwrap_or_else(|| "uncategorized".to_string());
            *summary.category_distribution.entry(category).or_default() += 1;

            for source in row.present_sources() {
                *summary.source_coverage.entry(source).or_default() += 1;
            }
            summary.last_refreshed = summary.last_refreshed.max(Some(row.last_refreshed));
        }

        if !rows.is_empty() {
            summary.avg_completeness /= rows.len() as f64;
            summary.avg_composite /= rows.len() as f64;
        }
        summary
    }
}

struct CachedRead {
    stored_at: Instant,
    rows: Arc<Vec<AggregateRow>>,
}

/// Ranked reads with a short-TTL cache in front of the store.
///
/// Every [`invalidate`](Self::invalidate) starts a new cache generation. A
/// store read that began in an earlier generation is returned to its caller
/// but never cached, so rows fetched before a publish cannot outlive it.
pub struct ReadInterface {
    store: Arc<dyn AggregateStore>,
    cache_ttl: Duration,
    default_limit: i64,
    cache: Mutex<HashMap<String, CachedRead>>,
    generation: AtomicU64,
}

impl ReadInterface {
    pub fn new(store: Arc<dyn AggregateStore>, cache_ttl: Duration, default_limit: i64) -> Self {
        Self {
            store,
            cache_ttl,
            default_limit,
            cache: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    /// Entities matching the filters, in ranking order
    pub async fn get_ranked_entities(&self, query: &RankedQuery) -> Result<Vec<AggregateRow>> {
        query.validate()?;

        let mut query = query.clone();
        query.limit.get_or_insert(self.default_limit);

        let rows = self.cached_read(&query).await?;
        Ok(rows.as_ref().clone())
    }

    /// Text search over name (relevance 1.0) and category (0.8), then composite score
    pub async fn search_entities(
        &self,
        text: &str,
        bounds: Option<Bounds>,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return Err(Error::InvalidInput("search text must not be empty".to_string()));
        }

        let query = RankedQuery {
            bounds,
            ..Default::default()
        };
        query.validate()?;
        let rows = self.cached_read(&query).await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .filter_map(|row| {
                let relevance = if row.name.to_lowercase().contains(&needle) {
                    NAME_MATCH_RELEVANCE
                } else if row
                    .category
                    .as_deref()
                    .is_some_and(|c| c.to_lowercase().contains(&needle))
                {
                    CATEGORY_MATCH_RELEVANCE
                } else {
                    return None;
                };
                Some(SearchHit {
                    relevance,
                    entity: row.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| b.entity.composite_score.total_cmp(&a.entity.composite_score))
                .then_with(|| ranking_cmp(&a.entity, &b.entity))
        });
        hits.truncate(limit.unwrap_or(self.default_limit as usize));
        Ok(hits)
    }

    pub async fn area_summary(&self, bounds: Option<Bounds>) -> Result<AreaSummary> {
        let query = RankedQuery {
            bounds,
            ..Default::default()
        };
        query.validate()?;
        let rows = self.cached_read(&query).await?;
        Ok(AreaSummary::from_rows(bounds, &rows))
    }

    /// Drop every cached result (called after a publish)
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, AtomicOrdering::SeqCst);
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    async fn cached_read(&self, query: &RankedQuery) -> Result<Arc<Vec<AggregateRow>>> {
        let key = query.cache_key();

        if !self.cache_ttl.is_zero() {
            if let Ok(cache) = self.cache.lock() {
                if let Some(entry) = cache.get(&key) {
                    if entry.stored_at.elapsed() < self.cache_ttl {
                        debug!(key = %key, "Read cache hit");
                        return Ok(Arc::clone(&entry.rows));
                    }
                }
            }
        }

        let generation = self.generation.load(AtomicOrdering::SeqCst);
        let rows = Arc::new(self.store.read_ranked(query).await?);

        if !self.cache_ttl.is_zero() {
            if let Ok(mut cache) = self.cache.lock() {
                if self.generation.load(AtomicOrdering::SeqCst) != generation {
                    debug!(key = %key, "Aggregate republished during read; not caching");
                    return Ok(rows);
                }
                let ttl = self.cache_ttl;
                cache.retain(|_, entry| entry.stored_at.elapsed() < ttl);
                cache.insert(
                    key,
                    CachedRead {
                        stored_at: Instant::now(),
                        rows: Arc::clone(&rows),
                    },
                );
            }
        }

        Ok(rows)
    }
}
