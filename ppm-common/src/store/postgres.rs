//! PostgreSQL aggregate store
//!
//! Computed rows are staged as a new generation in `master_entity_snapshot`
//! (one transaction). The materialized view `master_entity_data` selects the
//! newest generation, so publishing is `REFRESH MATERIALIZED VIEW`, which
//! swaps contents in place and leaves the old contents visible on error. The
//! view itself is never dropped or written to directly.
//!
//! A generation whose publish fails is deleted right away; older generations
//! are pruned after each successful publish.
//!
//! Readers connect with [`PostgresStore::connect_readonly`], which runs no DDL
//! and opens every session read-only.

use super::{
    AggregateStore, EncodedRow, Predicate, RawAggregate, SnapshotStats, StoreCapabilities,
    AGGREGATE_COLUMNS, HIGH_QUALITY_COMPLETENESS, RANKING_ORDER_SQL,
};
use crate::db::models::AggregateRow;
use crate::read::RankedQuery;
use crate::time::parse_storage_opt;
use crate::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::{debug, info, warn};

/// Bulk refresh procedure looked up at connect time
pub const BULK_PROCEDURE: &str = "refresh_all_master_data";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    capabilities: StoreCapabilities,
}

impl PostgresStore {
    /// Connect, create the staging table and view if missing, and detect the bulk procedure
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        create_schema(&pool).await?;
        Self::from_pool(pool).await
    }

    /// Connect to an existing aggregate without touching the schema.
    ///
    /// Sessions are read-only, so every publish path fails on this store.
    pub async fn connect_readonly(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(url)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: PgPool) -> Result<Self> {
        let bulk_procedure: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_proc WHERE proname = $1)")
                .bind(BULK_PROCEDURE)
                .fetch_one(&pool)
                .await?;

        let capabilities = StoreCapabilities {
            native_views: true,
            bulk_procedure,
            row_mutation: false,
        };
        info!(?capabilities, "Connected PostgreSQL aggregate store");

        Ok(Self { pool, capabilities })
    }

    /// Write `rows` as a new generation; returns the generation number
    async fn stage(&self, rows: &[AggregateRow]) -> Result<i64> {
        let encoded = rows.iter().map(EncodedRow::encode).collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("LOCK TABLE master_entity_snapshot IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        let generation: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(generation), 0)::BIGINT + 1 FROM master_entity_snapshot")
                .fetch_one(&mut *tx)
                .await?;

        for row in &encoded {
            insert_row(&mut tx, generation, row).await?;
        }
        tx.commit().await?;

        debug!(generation, rows = encoded.len(), "Staged aggregate generation");
        Ok(generation)
    }

    /// Stage `rows`, run `command` to publish them, then prune or discard the generation
    async fn publish(&self, rows: &[AggregateRow], command: &str) -> Result<()> {
        let generation = self.stage(rows).await?;
        match sqlx::query(command).execute(&self.pool).await {
            Ok(_) => {
                self.prune(generation).await;
                Ok(())
            }
            Err(e) => {
                self.discard(generation).await;
                Err(e.into())
            }
        }
    }

    /// Delete a staged generation that never got published
    async fn discard(&self, generation: i64) {
        match sqlx::query("DELETE FROM master_entity_snapshot WHERE generation = $1")
            .bind(generation)
            .execute(&self.pool)
            .await
        {
            Ok(result) => debug!(generation, rows = result.rows_affected(), "Discarded unpublished generation"),
            Err(e) => warn!(generation, error = %e, "Failed to discard unpublished generation"),
        }
    }

    /// Drop generations older than the published one
    async fn prune(&self, published: i64) {
        match sqlx::query("DELETE FROM master_entity_snapshot WHERE generation < $1")
            .bind(published)
            .execute(&self.pool)
            .await
        {
            Ok(result) => debug!(published, pruned = result.rows_affected(), "Pruned old generations"),
            Err(e) => warn!(published, error = %e, "Failed to prune old aggregate generations"),
        }
    }
}

async fn create_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS master_entity_snapshot (
            generation BIGINT NOT NULL,
            entity_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            external_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT,
            status TEXT NOT NULL,
            lat DOUBLE PRECISION NOT NULL,
            lng DOUBLE PRECISION NOT NULL,
            address TEXT,
            starts_at TEXT,
            ends_at TEXT,
            venue_id TEXT,
            prediction TEXT,
            sentiment TEXT,
            foot_traffic TEXT,
            traffic TEXT,
            weather TEXT,
            demographic TEXT,
            economic TEXT,
            data_completeness_score DOUBLE PRECISION NOT NULL CHECK (data_completeness_score BETWEEN 0 AND 1),
            composite_score DOUBLE PRECISION NOT NULL CHECK (composite_score >= 0),
            data_source_type TEXT NOT NULL,
            latest_observation_at TEXT,
            last_refreshed TEXT NOT NULL,
            PRIMARY KEY (generation, entity_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    let view = format!(
        r#"
        CREATE MATERIALIZED VIEW IF NOT EXISTS master_entity_data AS
        SELECT {}
        FROM master_entity_snapshot
        WHERE generation = (SELECT MAX(generation) FROM master_entity_snapshot)
        "#,
        AGGREGATE_COLUMNS
    );
    sqlx::query(&view).execute(pool).await?;

    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_master_entity_data_id ON master_entity_data (entity_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn insert_row(conn: &mut PgConnection, generation: i64, encoded: &EncodedRow<'_>) -> Result<()> {
    let row = encoded.row;
    let sql = format!(
        "INSERT INTO master_entity_snapshot (generation, {}) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)",
        AGGREGATE_COLUMNS
    );
    sqlx::query(&sql)
        .bind(generation)
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

fn raw_from_row(row: &PgRow) -> Result<RawAggregate> {
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
impl AggregateStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn refresh_native_view(&self, rows: &[AggregateRow]) -> Result<()> {
        self.publish(rows, "REFRESH MATERIALIZED VIEW master_entity_data").await
    }

    async fn run_bulk_procedure(&self, rows: &[AggregateRow]) -> Result<()> {
        self.publish(rows, &format!("SELECT {}()", BULK_PROCEDURE)).await
    }

    async fn read_ranked(&self, query: &RankedQuery) -> Result<Vec<AggregateRow>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
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
                    qb.push(" AND (starts_at IS NULL OR starts_at COLLATE "C" >= ").push_bind(from).push(")");
                }
                Predicate::StartsBefore(before) => {
                    qb.push(" AND (starts_at IS NULL OR starts_at COLLATE "C" < ").push_bind(before).push(")");
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
                COUNT(*)::BIGINT AS entity_count,
                COALESCE(SUM(CASE WHEN data_completeness_score >= $1 THEN 1 ELSE 0 END), 0)::BIGINT AS healthy_count,
                COALESCE(SUM(CASE WHEN data_completeness_score >= $2 THEN 1 ELSE 0 END), 0)::BIGINT AS high_quality_count,
                COALESCE(AVG(data_completeness_score), 0)::FLOAT8 AS avg_completeness,
                COALESCE(AVG(composite_score), 0)::FLOAT8 AS avg_composite,
                MAX(last_refreshed) AS last_refreshed
            FROM master_entity_data
            "#,
        )
        .bind(healthy_completeness)
        .bind(HIGH_QUALITY_COMPLETENESS)
        .fetch_one(&self.pool)
        .await?;

        let distribution: Vec<(String, i64)> = sqlx::query_as(
            "SELECT data_source_type, COUNT(*)::BIGINT FROM master_entity_data GROUP BY data_source_type",
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
