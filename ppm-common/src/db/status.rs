//! Collection/refresh status bookkeeping
//!
//! One row per named refresh job. Success and failure both upsert the row;
//! a failure never touches `last_successful_collection` or `health_score`.

use crate::db::models::CollectionStatus;
use crate::time::{parse_storage_opt, to_storage};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// Source type recorded for refresh jobs
pub const REFRESH_JOB_TYPE: &str = "refresh_job";

/// Outcome of one run, as persisted
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub attempted_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub details: serde_json::Value,
}

#[derive(Clone)]
pub struct StatusStore {
    pool: SqlitePool,
}

impl StatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record_success(
        &self,
        source_name: &str,
        run: &RunRecord,
        health_score: f64,
        records: i64,
    ) -> Result<()> {
        let attempted_at = to_storage(&run.attempted_at);
        let details = serde_json::to_string(&run.details)?;

        sqlx::query(
            r#"
            INSERT INTO collection_status (
                source_name, source_type, last_successful_collection, last_attempted_collection,
                health_score, error_count, consecutive_errors, total_runs, successful_runs,
                records_last_run, last_duration_seconds, status_details
            ) VALUES (?, ?, ?, ?, ?, 0, 0, 1, 1, ?, ?, ?)
            ON CONFLICT(source_name) DO UPDATE SET
                last_successful_collection = excluded.last_successful_collection,
                last_attempted_collection = excluded.last_attempted_collection,
                health_score = excluded.health_score,
                consecutive_errors = 0,
                total_runs = collection_status.total_runs + 1,
                successful_runs = collection_status.successful_runs + 1,
                records_last_run = excluded.records_last_run,
                last_duration_seconds = excluded.last_duration_seconds,
                status_details = excluded.status_details
            "#,
        )
        .bind(source_name)
        .bind(REFRESH_JOB_TYPE)
        .bind(&attempted_at)
        .bind(&attempted_at)
        .bind(health_score.clamp(0.0, 1.0))
        .bind(records)
        .bind(run.duration_seconds)
        .bind(&details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_failure(&self, source_name: &str, run: &RunRecord) -> Result<()> {
        let details = serde_json::to_string(&run.details)?;

        sqlx::query(
            r#"
            INSERT INTO collection_status (
                source_name, source_type, last_successful_collection, last_attempted_collection,
                health_score, error_count, consecutive_errors, total_runs, successful_runs,
                records_last_run, last_duration_seconds, status_details
            ) VALUES (?, ?, NULL, ?, 0, 1, 1, 1, 0, 0, ?, ?)
            ON CONFLICT(source_name) DO UPDATE SET
                last_attempted_collection = excluded.last_attempted_collection,
                error_count = collection_status.error_count + 1,
                consecutive_errors = collection_status.consecutive_errors + 1,
                total_runs = collection_status.total_runs + 1,
                last_duration_seconds = excluded.last_duration_seconds,
                status_details = excluded.status_details
            "#,
        )
        .bind(source_name)
        .bind(REFRESH_JOB_TYPE)
        .bind(to_storage(&run.attempted_at))
        .bind(run.duration_seconds)
        .bind(&details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load(&self, source_name: &str) -> Result<Option<CollectionStatus>> {
        let row = sqlx::query("SELECT * FROM collection_status WHERE source_name = ?")
            .bind(source_name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(status_from_row).transpose()
    }

    pub async fn load_all(&self) -> Result<Vec<CollectionStatus>> {
        let rows = sqlx::query("SELECT * FROM collection_status ORDER BY source_name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(status_from_row).collect()
    }
}

fn status_from_row(row: &SqliteRow) -> Result<CollectionStatus> {
    let details: Option<String> = row.try_get("status_details")?;
    let status_details = details
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(CollectionStatus {
        source_name: row.try_get("source_name")?,
        source_type: row.try_get("source_type")?,
        last_successful_collection: parse_storage_opt(row.try_get("last_successful_collection")?)?,
        last_attempted_collection: parse_storage_opt(row.try_get("last_attempted_collection")?)?,
        health_score: row.try_get("health_score")?,
        error_count: row.try_get("error_count")?,
        consecutive_errors: row.try_get("consecutive_errors")?,
        total_runs: row.try_get("total_runs")?,
        successful_runs: row.try_get("successful_runs")?,
        records_last_run: row.try_get("records_last_run")?,
        last_duration_seconds: row.try_get("last_duration_seconds")?,
        status_details,
    })
}
