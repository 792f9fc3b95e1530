//! # Provider Status Queue Repository
//!
//! Same contract as the presence event queue, for location provider
//! enabled/disabled changes. Kept in its own table so a backlog of one kind
//! never delays the other.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use waypost_core::event::ProviderStatusEvent;

use super::to_millis;
use crate::error::DbResult;

/// A queued provider status change.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedProviderEvent {
    pub seq: i64,
    pub event: ProviderStatusEvent,
    pub attempts: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ProviderRow {
    seq: i64,
    local_id: String,
    payload: String,
    attempts: i64,
}

/// Repository for the provider status queue.
#[derive(Debug, Clone)]
pub struct ProviderEventRepository {
    pool: SqlitePool,
}

impl ProviderEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ProviderEventRepository { pool }
    }

    pub async fn enqueue(&self, event: &ProviderStatusEvent) -> DbResult<bool> {
        let payload = serde_json::to_string(event)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO provider_event_queue (
                local_id, enabled, actor_id, occurred_at_ms, payload, queued_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&event.local_id)
        .bind(event.enabled)
        .bind(&event.actor_id)
        .bind(to_millis(event.occurred_at))
        .bind(payload)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!(local_id = %event.local_id, kind = event.kind(), "Provider status queued");
        Ok(result.rows_affected() > 0)
    }

    /// Oldest entries first; undecodable rows are deleted and skipped.
    pub async fn pending(&self, limit: u32) -> DbResult<Vec<QueuedProviderEvent>> {
        self.pending_after(0, limit).await
    }

    /// Entries with `seq > after_seq`, oldest first. Lets a drain pass walk
    /// past entries it leaves queued.
    pub async fn pending_after(&self, after_seq: i64, limit: u32) -> DbResult<Vec<QueuedProviderEvent>> {
        let rows = sqlx::query_as::<_, ProviderRow>(
            r#"
            SELECT seq, local_id, payload, attempts
            FROM provider_event_queue
            WHERE seq > ?1
            ORDER BY seq ASC
            LIMIT ?2
            "#,
        )
        .bind(after_seq)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_str::<ProviderStatusEvent>(&row.payload) {
                Ok(event) => entries.push(QueuedProviderEvent {
                    seq: row.seq,
                    event,
                    attempts: row.attempts,
                }),
                Err(e) => {
                    warn!(seq = row.seq, error = %e, "Dropping undecodable provider status");
                    self.remove(&row.local_id).await?;
                }
            }
        }
        Ok(entries)
    }

    pub async fn remove(&self, local_id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM provider_event_queue WHERE local_id = ?1")
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_failure(&self, local_id: &str, error: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE provider_event_queue SET attempts = attempts + 1, last_error = ?2 WHERE local_id = ?1",
        )
        .bind(local_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM provider_event_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM provider_event_queue WHERE queued_at_ms < ?1")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
