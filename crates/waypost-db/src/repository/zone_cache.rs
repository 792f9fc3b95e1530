//! # Zone Cache Repository
//!
//! Keeps the last accepted zone set so the tracker can evaluate fixes
//! before (or without) reaching the remote store.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use waypost_core::zone::Zone;

use super::to_millis;
use crate::error::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct ZoneRow {
    code: String,
    name: String,
    latitude: f64,
    longitude: f64,
    radius: f64,
}

impl From<ZoneRow> for Zone {
    fn from(row: ZoneRow) -> Self {
        // Rows were validated before they were cached
        Zone {
            code: row.code,
            name: row.name,
            latitude: row.latitude,
            longitude: row.longitude,
            radius_m: row.radius,
        }
    }
}

/// Repository for the zone cache.
#[derive(Debug, Clone)]
pub struct ZoneCacheRepository {
    pool: SqlitePool,
}

impl ZoneCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ZoneCacheRepository { pool }
    }

    /// Replaces the cached set in one transaction, preserving order.
    pub async fn replace_all(&self, zones: &[Zone]) -> DbResult<usize> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM zone_cache")
            .execute(&mut *tx)
            .await?;

        for (position, zone) in zones.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO zone_cache (position, code, name, latitude, longitude, radius, cached_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(position as i64)
            .bind(&zone.code)
            .bind(&zone.name)
            .bind(zone.latitude)
            .bind(zone.longitude)
            .bind(zone.radius_m)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = zones.len(), "Zone cache replaced");
        Ok(zones.len())
    }

    /// Loads the cached set in its original order.
    pub async fn load_all(&self) -> DbResult<Vec<Zone>> {
        let rows = sqlx::query_as::<_, ZoneRow>(
            r#"
            SELECT code, name, latitude, longitude, radius
            FROM zone_cache
            ORDER BY position ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Zone::from).collect())
    }
}
