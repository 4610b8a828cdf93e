//! Entity store (venues and events)

use crate::db::models::{Entity, EntityKind, EntityStatus, NewEntity};
use crate::time::{parse_storage, parse_storage_opt, to_storage};
use crate::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

const ENTITY_COLUMNS: &str = "entity_id, kind, external_id, provider, name, category, status, \
     lat, lng, address, starts_at, ends_at, venue_name, updated_at";

/// Durable table of canonical entities
#[derive(Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update by `(external_id, provider)`; returns the stable `entity_id`.
    ///
    /// Identity fields never change on update; descriptive fields are last-write-wins.
    pub async fn upsert(&self, entity: &NewEntity) -> Result<String> {
        entity.validate()?;

        let now = to_storage(&crate::time::now());
        let candidate_id = Uuid::new_v4().to_string();

        let entity_id: String = sqlx::query_scalar(
            r#"
            INSERT INTO entities (
                entity_id, kind, external_id, provider, name, category, status,
                lat, lng, address, starts_at, ends_at, venue_name, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id, provider) DO UPDATE SET
                name = excluded.name,
                category = excluded.category,
                status = excluded.status,
                lat = excluded.lat,
                lng = excluded.lng,
                address = excluded.address,
                starts_at = excluded.starts_at,
                ends_at = excluded.ends_at,
                venue_name = excluded.venue_name,
                updated_at = excluded.updated_at
            RETURNING entity_id
            "#,
        )
        .bind(&candidate_id)
        .bind(entity.kind.as_str())
        .bind(&entity.external_id)
        .bind(&entity.provider)
        .bind(&entity.name)
        .bind(&entity.category)
        .bind(entity.status.as_str())
        .bind(entity.lat)
        .bind(entity.lng)
        .bind(&entity.address)
        .bind(entity.starts_at.as_ref().map(to_storage))
        .bind(entity.ends_at.as_ref().map(to_storage))
        .bind(&entity.venue_name)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            entity_id = %entity_id,
            provider = %entity.provider,
            external_id = %entity.external_id,
            "Upserted entity"
        );
        Ok(entity_id)
    }

    pub async fn get(&self, entity_id: &str) -> Result<Option<Entity>> {
        let sql = format!("SELECT {} FROM entities WHERE entity_id = ?", ENTITY_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    /// Soft lifecycle change (closed venue, cancelled event)
    pub async fn set_status(&self, entity_id: &str, status: EntityStatus) -> Result<()> {
        let result = sqlx::query("UPDATE entities SET status = ?, updated_at = ? WHERE entity_id = ?")
            .bind(status.as_str())
            .bind(to_storage(&crate::time::now()))
            .bind(entity_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("entity {}", entity_id)));
        }
        Ok(())
    }

    /// Every stored entity ordered by `entity_id`.
    ///
    /// Rows that fail to decode come back as `Err` so the caller can skip them
    /// individually.
    pub async fn load_all(&self) -> Result<Vec<(String, Result<Entity>)>> {
        let sql = format!("SELECT {} FROM entities ORDER BY entity_id", ENTITY_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let entity_id = row
                    .try_get::<Option<String>, _>("entity_id")
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                (entity_id, entity_from_row(row))
            })
            .collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Entity {
        entity_id: row.try_get("entity_id")?,
        kind: EntityKind::parse(&kind)?,
        external_id: row.try_get("external_id")?,
        provider: row.try_get("provider")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        status: EntityStatus::parse(&status)?,
        lat: row.try_get("lat")?,
        lng: row.try_get("lng")?,
        address: row.try_get("address")?,
        starts_at: parse_storage_opt(row.try_get("starts_at")?)?,
        ends_at: parse_storage_opt(row.try_get("ends_at")?)?,
        venue_name: row.try_get("venue_name")?,
        updated_at: parse_storage(&updated_at)?,
    })
}
