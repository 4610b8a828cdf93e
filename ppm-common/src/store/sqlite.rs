//! SQLite aggregate store
//!
//! SQLite has no materialized views, so the aggregate is an ordinary table
//! (`master_entity_data`) replaced wholesale inside one transaction. With the
//! database in WAL mode, readers keep seeing the previous snapshot until the
//! transaction commits.

use super::{
    AggregateStore, EncodedRow, Predicate, RawAggregate, SnapshotStats, StoreCapabilities,
    AGGREGATE_COLUMNS, HIGH_QUALITY_COMPLETENESS, RANKING_ORDER_SQL,
};
use crate::db::models::AggregateRow;
use crate::read::RankedQuery;
use crate::time::parse_storage_opt;
use crate::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap a pool whose schema was created by `init_database`
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_row(conn: &mut SqliteConnection, encoded: &EncodedRow<'_>) -> Result<()> {
    let row = encoded.row;
    let sql = format!(
        "INSERT INTO master_entity_data ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        AGGREGATE_COLUMNS
    );
    sqlx::query(&sql)
        .bind(&row.entity_id)
        .bind(row.kind.as_str())
        .bind(&row.external_id)
        .bind(&row.provider)
        .bind(&row.name)
        .bind(&row.category)
        .bind(row.status.as_str())
        .bind(row.lat)
        .bind(row.lng)
        .bind(&row.address)
        .bind(&encoded.starts_at)
        .bind(&encoded.ends_at)
        .bind(&row.venue_id)
        .bind(&encoded.prediction)
        .bind(&encoded.sentiment)
        .bind(&encoded.foot_traffic)
        .bind(&encoded.traffic)
        .bind(&encoded.weather)
        .bind(&encoded.demographic)
        .bind(&encoded.economic)
        .bind(row.data_completeness_score)
        .bind(row.composite_score)
        .bind(&row.data_source_type)
        .bind(&encoded.latest_observation_at)
        .bind(&encoded.last_refreshed)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn raw_from_row(row: &SqliteRow) -> Result<RawAggregate> {
    Ok(RawAggregate {
        entity_id: row.try_get("entity_id")?,
        kind: row.try_get("kind")?,
        external_id: row.try_get("external_id")?,
        provider: row.try_get("provider")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        status: row.try_get("status")?,
        lat: row.try_get("lat")?,
        lng: row.try_get("lng")?,
        address: row.try_get("address")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        venue_id: row.try_get("venue_id")?,
        prediction: row.try_get("prediction")?,
        sentiment: row.try_get("sentiment")?,
        foot_traffic: row.try_get("foot_traffic")?,
        traffic: row.try_get("traffic")?,
        weather: row.try_get("weather")?,
        demographic: row.try_get("demographic")?,
        economic: row.try_get("economic")?,
        data_completeness_score: row.try_get("data_completeness_score")?,
        composite_score: row.try_get("composite_score")?,
        data_source_type: row.try_get("data_source_type")?,
        latest_observation_at: row.try_get("latest_observation_at")?,
        last_refreshed: row.try_get("last_refreshed")?,
    })
}

#[async_trait]
impl AggregateStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            native_views: false,
            bulk_procedure: false,
            row_mutation: true,
        }
    }

    async fn replace_all(&self, rows: &[AggregateRow]) -> Result<()> {
        // Encode everything before touching the table
        let encoded = rows.iter().map(EncodedRow::encode).collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM master_entity_data")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for row in &encoded {
            insert_row(&mut tx, row).await?;
        }

        tx.commit().await?;

        debug!(deleted, inserted = encoded.len(), "Replaced aggregate snapshot");
        Ok(())
    }

    async fn read_ranked(&self, query: &RankedQuery) -> Result<Vec<AggregateRow>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM master_entity_data WHERE 1 = 1",
            AGGREGATE_COLUMNS
        ));

        for predicate in query.predicates() {
            match predicate {
                Predicate::LatBetween(lo, hi) => {
                    qb.push(" AND lat BETWEEN ").push_bind(lo).push(" AND ").push_bind(hi);
                }
                Predicate::LngBetween(lo, hi) => {
                    qb.push(" AND lng BETWEEN ").push_bind(lo).push(" AND ").push_bind(hi);
                }
                Predicate::CategoryEquals(category) => {
                    qb.push(" AND LOWER(category) = ").push_bind(category);
                }
                Predicate::KindEquals(kind) => {
                    qb.push(" AND kind = ").push_bind(kind);
                }
                Predicate::MinCompleteness(min) => {
                    qb.push(" AND data_completeness_score >= ").push_bind(min);
                }
                Predicate::MinComposite(min) => {
                    qb.push(" AND composite_score >= ").push_bind(min);
                }
                Predicate::StartsFrom(from) => {
                    qb.push(" AND (starts_at IS NULL OR starts_at >= ").push_bind(from).push(")");
                }
                Predicate::StartsBefore(before) => {
                    qb.push(" AND (starts_at IS NULL OR starts_at < ").push_bind(before).push(")");
                }
                Predicate::StatusEquals(status) => {
                    qb.push(" AND status = ").push_bind(status);
                }
            }
        }

        qb.push(" ORDER BY ").push(RANKING_ORDER_SQL);
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| raw_from_row(row).and_then(RawAggregate::decode))
            .collect()
    }

    async fn snapshot_stats(&self, healthy_completeness: f64) -> Result<SnapshotStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS entity_count,
                COALESCE(SUM(CASE WHEN data_completeness_score >= ? THEN 1 ELSE 0 END), 0) AS healthy_count,
                COALESCE(SUM(CASE WHEN data_completeness_score >= ? THEN 1 ELSE 0 END), 0) AS high_quality_count,
                COALESCE(AVG(data_completeness_score), 0.0) AS avg_completeness,
                COALESCE(AVG(composite_score), 0.0) AS avg_composite,
                MAX(last_refreshed) AS last_refreshed
            FROM master_entity_data
            "#,
        )
        .bind(healthy_completeness)
        .bind(HIGH_QUALITY_COMPLETENESS)
        .fetch_one(&self.pool)
        .await?;

        let distribution: Vec<(String, i64)> = sqlx::query_as(
            "SELECT data_source_type, COUNT(*) FROM master_entity_data GROUP BY data_source_type",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(SnapshotStats {
            entity_count: row.try_get("entity_count")?,
            healthy_count: row.try_get("healthy_count")?,
            high_quality_count: row.try_get("high_quality_count")?,
            avg_completeness: row.try_get("avg_completeness")?,
            avg_composite: row.try_get("avg_composite")?,
            last_refreshed: parse_storage_opt(row.try_get("last_refreshed")?)?,
            source_distribution: distribution.into_iter().collect(),
        })
    }
}
