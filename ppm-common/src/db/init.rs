//! Database initialization
//!
//! Creates the SQLite database on first run and applies the schema
//! idempotently (`CREATE TABLE IF NOT EXISTS`) on every start.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 2;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // Per-connection pragmas
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets readers keep seeing the last committed snapshot while a refresh writes
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Apply the full schema (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_entities_table(pool).await?;
    create_observations_table(pool).await?;
    create_master_entity_data_table(pool).await?;
    create_collection_status_table(pool).await?;
    migrate_v2(pool).await?;
    Ok(())
}

/// v2: event venue linkage and end times
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    add_column_if_missing(pool, "entities", "venue_name", "TEXT").await?;
    add_column_if_missing(pool, "master_entity_data", "ends_at", "TEXT").await?;
    add_column_if_missing(pool, "master_entity_data", "venue_id", "TEXT").await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(2_i64)
        .execute(pool)
        .await?;
    Ok(())
}

async fn add_column_if_missing(pool: &SqlitePool, table: &str, column: &str, decl: &str) -> Result<()> {
    let sql = format!("SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = ?", table);
    let has_column: i64 = sqlx::query_scalar(&sql).bind(column).fetch_one(pool).await?;

    if has_column == 0 {
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
            .execute(pool)
            .await?;
        info!("Migration v2: added {}.{}", table, column);
    }
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_entities_table(pool: &SqlitePool) -> Result<()> {
    // No CHECK tying lat/lng together: rows written by other tools may break the
    // pairing and must be skipped (with a warning) at aggregation time
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            entity_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK (kind IN ('venue', 'event')),
            external_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'closed', 'cancelled')),
            lat REAL,
            lng REAL,
            address TEXT,
            starts_at TEXT,
            ends_at TEXT,
            venue_name TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (external_id, provider)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_location ON entities(lat, lng)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_observations_table(pool: &SqlitePool) -> Result<()> {
    // Append-only; observation_id is the insertion-order tie-break
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS observations (
            observation_id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            entity_id TEXT,
            lat REAL,
            lng REAL,
            tract_id TEXT,
            polygon TEXT,
            area TEXT,
            observed_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            ingested_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_observations_source ON observations(source, observed_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_observations_entity ON observations(entity_id, source)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_master_entity_data_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS master_entity_data (
            entity_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            external_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT,
            status TEXT NOT NULL,
            lat REAL NOT NULL,
            lng REAL NOT NULL,
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
            data_completeness_score REAL NOT NULL CHECK (data_completeness_score >= 0 AND data_completeness_score <= 1),
            composite_score REAL NOT NULL CHECK (composite_score >= 0),
            data_source_type TEXT NOT NULL,
            latest_observation_at TEXT,
            last_refreshed TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_master_entity_rank ON master_entity_data(data_completeness_score DESC, composite_score DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_master_entity_location ON master_entity_data(lat, lng)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_collection_status_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collection_status (
            source_name TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            last_successful_collection TEXT,
            last_attempted_collection TEXT,
            health_score REAL NOT NULL DEFAULT 0 CHECK (health_score >= 0 AND health_score <= 1),
            error_count INTEGER NOT NULL DEFAULT 0,
            consecutive_errors INTEGER NOT NULL DEFAULT 0,
            total_runs INTEGER NOT NULL DEFAULT 0,
            successful_runs INTEGER NOT NULL DEFAULT 0,
            records_last_run INTEGER NOT NULL DEFAULT 0,
            last_duration_seconds REAL,
            status_details TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
