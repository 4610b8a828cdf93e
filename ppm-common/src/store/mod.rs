//! Aggregate backing stores
//!
//! The refresh controller publishes computed rows through one of three paths;
//! which ones a store offers is fixed at construction time and reported by
//! [`AggregateStore::capabilities`]:
//!
//! | Capability       | Operation                 | SQLite | PostgreSQL |
//! |------------------|---------------------------|--------|------------|
//! | `native_views`   | `refresh_native_view`     | no     | yes        |
//! | `bulk_procedure` | `run_bulk_procedure`      | no     | if `refresh_all_master_data()` exists |
//! | `row_mutation`   | `replace_all`             | yes    | no         |
//!
//! Every publish path is all-or-nothing: on error the previously published
//! snapshot stays readable and unchanged.

#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

use crate::db::models::{AggregateRow, EntityKind, EntityStatus};
use crate::read::RankedQuery;
use crate::time::{parse_storage, parse_storage_opt, to_storage};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Completeness at or above which an entity counts as high quality
pub const HIGH_QUALITY_COMPLETENESS: f64 = 0.8;

/// Ranking contract shared by every backend's read path
pub const RANKING_ORDER_SQL: &str =
    "data_completeness_score DESC, composite_score DESC, latest_observation_at DESC NULLS LAST, entity_id ASC";

/// Column list of the aggregate table/view, in insert order
pub const AGGREGATE_COLUMNS: &str = "entity_id, kind, external_id, provider, name, category, status, \
     lat, lng, address, starts_at, ends_at, venue_id, \
     prediction, sentiment, foot_traffic, traffic, weather, demographic, economic, \
     data_completeness_score, composite_score, data_source_type, latest_observation_at, last_refreshed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    pub native_views: bool,
    pub bulk_procedure: bool,
    pub row_mutation: bool,
}

/// Aggregate snapshot statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub entity_count: i64,
    pub healthy_count: i64,
    pub high_quality_count: i64,
    pub avg_completeness: f64,
    pub avg_composite: f64,
    pub last_refreshed: Option<DateTime<Utc>>,
    /// Entity count per `data_source_type`
    pub source_distribution: BTreeMap<String, i64>,
}

impl SnapshotStats {
    pub fn from_rows(rows: &[AggregateRow], healthy_completeness: f64) -> Self {
        let mut stats = SnapshotStats {
            entity_count: rows.len() as i64,
            ..Default::default()
        };
        if rows.is_empty() {
            return stats;
        }

        let mut completeness_sum = 0.0;
        let mut composite_sum = 0.0;
        for row in rows {
            completeness_sum += row.data_completeness_score;
            composite_sum += row.composite_score;
            if row.data_completeness_score >= healthy_completeness {
                stats.healthy_count += 1;
            }
            if row.data_completeness_score >= HIGH_QUALITY_COMPLETENESS {
                stats.high_quality_count += 1;
            }
            *stats
                .source_distribution
                .entry(row.data_source_type.clone())
                .or_default() += 1;
            stats.last_refreshed = stats.last_refreshed.max(Some(row.last_refreshed));
        }
        stats.avg_completeness = completeness_sum / rows.len() as f64;
        stats.avg_composite = composite_sum / rows.len() as f64;
        stats
    }

    /// Fraction of entities at or above the healthy completeness threshold
    pub fn healthy_fraction(&self) -> f64 {
        if self.entity_count == 0 {
            0.0
        } else {
            self.healthy_count as f64 / self.entity_count as f64
        }
    }

    /// Weighted snapshot health: completeness 0.4, high-quality ratio 0.3,
    /// volume (saturating at 100 entities) 0.2, freshness 0.1
    pub fn health_score(&self, now: DateTime<Utc>) -> f64 {
        let quality_ratio = self.high_quality_count as f64 / self.entity_count.max(1) as f64;
        let volume = (self.entity_count as f64 / 100.0).min(1.0);
        let freshness = match self.last_refreshed {
            Some(ts) if now - ts < chrono::Duration::hours(1) => 1.0,
            _ => 0.5,
        };
        self.avg_completeness * 0.4 + quality_ratio * 0.3 + volume * 0.2 + freshness * 0.1
    }
}

/// Backing store for the materialized aggregate
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Short backend name for logs and status details
    fn backend(&self) -> &'static str;

    fn capabilities(&self) -> StoreCapabilities;

    /// Stage `rows` and issue the store's refresh-in-place command
    async fn refresh_native_view(&self, _rows: &[AggregateRow]) -> Result<()> {
        Err(Error::Unsupported {
            backend: self.backend(),
            operation: "refresh_native_view",
        })
    }

    /// Stage `rows` and run the engine-registered bulk refresh procedure
    async fn run_bulk_procedure(&self, _rows: &[AggregateRow]) -> Result<()> {
        Err(Error::Unsupported {
            backend: self.backend(),
            operation: "run_bulk_procedure",
        })
    }

    /// Delete the prior aggregate and insert `rows` in one transaction
    async fn replace_all(&self, _rows: &[AggregateRow]) -> Result<()> {
        Err(Error::Unsupported {
            backend: self.backend(),
            operation: "replace_all",
        })
    }

    /// Filtered read in ranking order
    async fn read_ranked(&self, query: &RankedQuery) -> Result<Vec<AggregateRow>>;

    async fn snapshot_stats(&self, healthy_completeness: f64) -> Result<SnapshotStats>;
}

/// Aggregate row in column form, shared by the backends' write paths
pub(crate) struct EncodedRow<'a> {
    pub row: &'a AggregateRow,
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
    pub prediction: Option<String>,
    pub sentiment: Option<String>,
    pub foot_traffic: Option<String>,
    pub traffic: Option<String>,
    pub weather: Option<String>,
    pub demographic: Option<String>,
    pub economic: Option<String>,
    pub latest_observation_at: Option<String>,
    pub last_refreshed: String,
}

fn encode_section<T: Serialize>(section: &Option<T>) -> Result<Option<String>> {
    section
        .as_ref()
        .map(|value| serde_json::to_string(value).map_err(Error::from))
        .transpose()
}

impl<'a> EncodedRow<'a> {
    pub fn encode(row: &'a AggregateRow) -> Result<Self> {
        if !(0.0..=1.0).contains(&row.data_completeness_score) || !row.composite_score.is_finite() || row.composite_score < 0.0 {
            return Err(Error::Validation(format!(
                "aggregate for {} has out-of-range scores (completeness {}, composite {})",
                row.entity_id, row.data_completeness_score, row.composite_score
            )));
        }
        Ok(Self {
            row,
            starts_at: row.starts_at.as_ref().map(to_storage),
            ends_at: row.ends_at.as_ref().map(to_storage),
            prediction: encode_section(&row.prediction)?,
            sentiment: encode_section(&row.sentiment)?,
            foot_traffic: encode_section(&row.foot_traffic)?,
            traffic: encode_section(&row.traffic)?,
            weather: encode_section(&row.weather)?,
            demographic: encode_section(&row.demographic)?,
            economic: encode_section(&row.economic)?,
            latest_observation_at: row.latest_observation_at.as_ref().map(to_storage),
            last_refreshed: to_storage(&row.last_refreshed),
        })
    }
}

/// Aggregate row as read from any backend, before decoding
pub(crate) struct RawAggregate {
    pub entity_id: String,
    pub kind: String,
    pub external_id: String,
    pub provider: String,
    pub name: String,
    pub category: Option<String>,
    pub status: String,
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
    pub venue_id: Option<String>,
    pub prediction: Option<String>,
    pub sentiment: Option<String>,
    pub foot_traffic: Option<String>,
    pub traffic: Option<String>,
    pub weather: Option<String>,
    pub demographic: Option<String>,
    pub economic: Option<String>,
    pub data_completeness_score: f64,
    pub composite_score: f64,
    pub data_source_type: String,
    pub latest_observation_at: Option<String>,
    pub last_refreshed: String,
}

fn decode_section<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
    raw.as_deref()
        .map(|json| serde_json::from_str(json).map_err(Error::from))
        .transpose()
}

impl RawAggregate {
    pub fn decode(self) -> Result<AggregateRow> {
        Ok(AggregateRow {
            kind: EntityKind::parse(&self.kind)?,
            status: EntityStatus::parse(&self.status)?,
            starts_at: parse_storage_opt(self.starts_at)?,
            ends_at: parse_storage_opt(self.ends_at)?,
            prediction: decode_section(self.prediction)?,
            sentiment: decode_section(self.sentiment)?,
            foot_traffic: decode_section(self.foot_traffic)?,
            traffic: decode_section(self.traffic)?,
            weather: decode_section(self.weather)?,
            demographic: decode_section(self.demographic)?,
            economic: decode_section(self.economic)?,
            latest_observation_at: parse_storage_opt(self.latest_observation_at)?,
            last_refreshed: parse_storage(&self.last_refreshed)?,
            entity_id: self.entity_id,
            external_id: self.external_id,
            provider: self.provider,
            name: self.name,
            category: self.category,
            lat: self.lat,
            lng: self.lng,
            address: self.address,
            venue_id: self.venue_id,
            data_completeness_score: self.data_completeness_score,
            composite_score: self.composite_score,
            data_source_type: self.data_source_type,
        })
    }
}

/// Filter predicates of a ranked query, rendered by each backend
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Predicate {
    LatBetween(f64, f64),
    LngBetween(f64, f64),
    CategoryEquals(String),
    KindEquals(&'static str),
    MinCompleteness(f64),
    MinComposite(f64),
    /// Storage-format lower bound on `starts_at`, inclusive; untimed rows pass
    StartsFrom(String),
    /// Storage-format upper bound on `starts_at`, exclusive; untimed rows pass
    StartsBefore(String),
    StatusEquals(&'static str),
}

impl RankedQuery {
    pub(crate) fn predicates(&self) -> Vec<Predicate> {
        let mut predicates = Vec::new();
        if let Some(bounds) = &self.bounds {
            predicates.push(Predicate::LatBetween(bounds.south, bounds.north));
            predicates.push(Predicate::LngBetween(bounds.west, bounds.east));
        }
        if let Some(category) = &self.category {
            predicates.push(Predicate::CategoryEquals(category.to_lowercase()));
        }
        if let Some(kind) = self.kind {
            predicates.push(Predicate::KindEquals(kind.as_str()));
        }
        if let Some(min) = self.min_completeness {
            predicates.push(Predicate::MinCompleteness(min));
        }
        if let Some(min) = self.min_composite {
            predicates.push(Predicate::MinComposite(min));
        }
        if let Some(from) = &self.starts_from {
            predicates.push(Predicate::StartsFrom(to_storage(from)));
        }
        if let Some(before) = &self.starts_before {
            predicates.push(Predicate::StartsBefore(to_storage(before)));
        }
        if self.exclude_inactive {
            predicates.push(Predicate::StatusEquals(EntityStatus::Active.as_str()));
        }
        predicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(id: &str, completeness: f64, composite: f64, tag: &str) -> AggregateRow {
        AggregateRow {
            entity_id: id.to_string(),
            kind: EntityKind::Venue,
            external_id: id.to_string(),
            provider: "visitkc".to_string(),
            name: id.to_string(),
            category: None,
            status: EntityStatus::Active,
            lat: 39.1,
            lng: -94.58,
            address: None,
            starts_at: None,
            ends_at: None,
            venue_id: None,
            prediction: None,
            sentiment: None,
            foot_traffic: None,
            traffic: None,
            weather: None,
            demographic: None,
            economic: None,
            data_completeness_score: completeness,
            composite_score: composite,
            data_source_type: tag.to_string(),
            latest_observation_at: None,
            last_refreshed: Utc::now(),
        }
    }

    #[test]
    fn test_stats_from_rows() {
        let rows = vec![
            row("a", 1.0, 0.9, "api_places"),
            row("b", 0.6, 0.1, "scraped_local"),
            row("c", 0.2, 0.0, "scraped_local"),
        ];
        let stats = SnapshotStats::from_rows(&rows, 0.6);
        assert_eq!(stats.entity_count, 3);
        assert_eq!(stats.healthy_count, 2);
        assert_eq!(stats.high_quality_count, 1);
        assert!((stats.avg_completeness - 0.6).abs() < 1e-9);
        assert_eq!(stats.source_distribution["scraped_local"], 2);
        assert!((stats.healthy_fraction() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_stats() {
        let stats = SnapshotStats::from_rows(&[], 0.6);
        assert_eq!(stats.entity_count, 0);
        assert_eq!(stats.healthy_fraction(), 0.0);
        assert!(stats.last_refreshed.is_none());
    }

    #[test]
    fn test_health_score_weights() {
        let now = Utc::now();
        let stats = SnapshotStats {
            entity_count: 200,
            healthy_count: 200,
            high_quality_count: 100,
            avg_completeness: 0.8,
            avg_composite: 0.4,
            last_refreshed: Some(now - Duration::minutes(5)),
            source_distribution: BTreeMap::new(),
        };
        // 0.8*0.4 + 0.5*0.3 + 1.0*0.2 + 1.0*0.1
        assert!((stats.health_score(now) - 0.77).abs() < 1e-9);

        let stale = SnapshotStats {
            last_refreshed: Some(now - Duration::hours(3)),
            ..stats
        };
        assert!((stale.health_score(now) - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_window_and_status_predicates() {
        let from = Utc::now();
        let query = RankedQuery {
            starts_from: Some(from),
            starts_before: Some(from + Duration::days(30)),
            exclude_inactive: true,
            ..Default::default()
        };
        let predicates = query.predicates();
        assert!(predicates.contains(&Predicate::StartsFrom(to_storage(&from))));
        assert!(predicates.contains(&Predicate::StartsBefore(to_storage(&(from + Duration::days(30))))));
        assert!(predicates.contains(&Predicate::StatusEquals("active")));
        assert!(RankedQuery::default().predicates().is_empty());
    }

    #[test]
    fn test_encode_rejects_out_of_range_scores() {
        assert!(EncodedRow::encode(&row("a", 1.2, 0.0, "x")).is_err());
        assert!(EncodedRow::encode(&row("a", 0.5, -1.0, "x")).is_err());
        assert!(EncodedRow::encode(&row("a", 0.5, 0.3, "x")).is_ok());
    }
}
