//! # Offline Event Queue Repository
//!
//! Durable FIFO of presence events that have not reached the remote store.
//!
//! ## Queue Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Offline Queue                                        │
//! │                                                                         │
//! │  Emitter (offline, or remote write failed)                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  enqueue ──► INSERT (seq AUTOINCREMENT, local_id UNIQUE, JSON payload) │
//! │                                                                         │
//! │  Sync engine                                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  pending(limit) ──► ORDER BY seq ──► for each entry, one at a time:    │
//! │       ├── remote duplicate?  ──► remove                                │
//! │       ├── uploaded           ──► remove                                │
//! │       ├── rejected           ──► record_failure, keep, continue        │
//! │       └── unreachable        ──► keep, stop the pass                   │
//! │                                                                         │
//! │  Cleanup ──► purge_older_than(now - 7 days)                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dedup columns (`zone_code`, `kind`, `actor_id`, `occurred_at_ms`) are
//! copied out of the payload so the local duplicate check is one indexed
//! query.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use waypost_core::event::{DedupKey, DedupWindow, PresenceEvent};

use super::to_millis;
use crate::error::DbResult;

/// A queued event with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub seq: i64,
    pub event: PresenceEvent,
    pub attempts: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    seq: i64,
    local_id: String,
    payload: String,
    attempts: i64,
    last_error: Option<String>,
}

/// Inserts one event. Returns false when its `local_id` is already queued.
pub(crate) async fn insert_event(conn: &mut SqliteConnection, event: &PresenceEvent) -> DbResult<bool> {
    let payload = serde_json::to_string(event)?;

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO event_queue (
            local_id, zone_code, kind, actor_id, occurred_at_ms, payload, queued_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&event.local_id)
    .bind(&event.zone_code)
    .bind(event.kind.as_str())
    .bind(&event.actor_id)
    .bind(to_millis(event.occurred_at))
    .bind(payload)
    .bind(to_millis(Utc::now()))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Repository for the offline presence event queue.
#[derive(Debug, Clone)]
pub struct EventQueueRepository {
    pool: SqlitePool,
}

impl EventQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EventQueueRepository { pool }
    }

    /// Appends an event. Idempotent per `local_id`.
    pub async fn enqueue(&self, event: &PresenceEvent) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let inserted = insert_event(&mut conn, event).await?;

        debug!(
            local_id = %event.local_id,
            zone = %event.zone_code,
            kind = %event.kind,
            inserted,
            "Event queued"
        );
        Ok(inserted)
    }

    /// Oldest entries first.
    ///
    /// A row whose payload no longer decodes is deleted and skipped, so one
    /// corrupt entry cannot wedge the queue.
    pub async fn pending(&self, limit: u32) -> DbResult<Vec<QueuedEvent>> {
        self.pending_after(0, limit).await
    }

    /// Entries with `seq > after_seq`, oldest first. Lets a drain pass walk
    /// past entries it leaves queued.
    pub async fn pending_after(&self, after_seq: i64, limit: u32) -> DbResult<Vec<QueuedEvent>> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT seq, local_id, payload, attempts, last_error
            FROM event_queue
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
            match serde_json::from_str::<PresenceEvent>(&row.payload) {
                Ok(event) => entries.push(QueuedEvent {
                    seq: row.seq,
                    event,
                    attempts: row.attempts,
                    last_error: row.last_error,
                }),
                Err(e) => {
                    warn!(seq = row.seq, local_id = %row.local_id, error = %e, "Dropping undecodable queued event");
                    self.remove(&row.local_id).await?;
                }
            }
        }
        Ok(entries)
    }

    /// Removes an entry. Returns whether it existed.
    pub async fn remove(&self, local_id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM event_queue WHERE local_id = ?1")
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records a failed delivery attempt; the entry stays queued.
    pub async fn record_failure(&self, local_id: &str, error: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE event_queue SET
                attempts = attempts + 1,
                last_error = ?2
            WHERE local_id = ?1
            "#,
        )
        .bind(local_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// True when an entry with the same key lies within `window` of `at`
    /// (inclusive on both ends).
    pub async fn contains_duplicate(
        &self,
        key: &DedupKey,
        at: DateTime<Utc>,
        window: DedupWindow,
    ) -> DbResult<bool> {
        let (from, to) = window.range(at);
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM event_queue
            WHERE zone_code = ?1
              AND kind = ?2
              AND actor_id = ?3
              AND occurred_at_ms BETWEEN ?4 AND ?5
            "#,
        )
        .bind(&key.zone_code)
        .bind(key.kind.as_str())
        .bind(&key.actor_id)
        .bind(to_millis(from))
        .bind(to_millis(to))
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Deletes entries queued before `cutoff`. Returns how many went.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM event_queue WHERE queued_at_ms < ?1")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Duration;
    use waypost_core::confirmation::{Transition, TransitionReason};
    use waypost_core::event::{Actor, EventKind};
    use waypost_core::geo::Position;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn event(kind: EventKind, zone: &str, secs: i64) -> PresenceEvent {
        let transition = Transition {
            kind,
            zone_code: zone.to_string(),
            position: Position::new(1.0, 2.0),
            at: t0() + Duration::seconds(secs),
            reason: TransitionReason::Confirmed,
        };
        PresenceEvent::from_transition(&transition, None, &Actor::new("u-1", "Ana"), 5.0)
    }

    #[tokio::test]
    async fn test_fifo_order_and_remove() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.event_queue();

        let first = event(EventKind::Entry, "A", 0);
        let second = event(EventKind::Exit, "A", 600);
        assert!(queue.enqueue(&first).await.unwrap());
        assert!(queue.enqueue(&second).await.unwrap());
        assert!(!queue.enqueue(&first).await.unwrap());
        assert_eq!(queue.count().await.unwrap(), 2);

        let pending = queue.pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].event, first);
        assert_eq!(pending[1].event, second);
        assert!(pending[0].seq < pending[1].seq);

        assert!(queue.remove(&first.local_id).await.unwrap());
        assert!(!queue.remove(&first.local_id).await.unwrap());
        assert_eq!(queue.pending(10).await.unwrap()[0].event, second);
    }

    #[tokio::test]
    async fn test_failure_bookkeeping() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.event_queue();
        let ev = event(EventKind::Entry, "A", 0);
        queue.enqueue(&ev).await.unwrap();

        queue.record_failure(&ev.local_id, "rejected").await.unwrap();
        queue.record_failure(&ev.local_id, "rejected again").await.unwrap();

        let entry = &queue.pending(1).await.unwrap()[0];
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.last_error.as_deref(), Some("rejected again"));
    }

    #[tokio::test]
    async fn test_local_duplicate_window() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.event_queue();
        let ev = event(EventKind::Entry, "A", 0);
        queue.enqueue(&ev).await.unwrap();

        let window = DedupWindow::default();
        let key = ev.dedup_key();
        for (secs, expected) in [(120, true), (-120, true), (121, false)] {
            let at = t0() + Duration::seconds(secs);
            assert_eq!(queue.contains_duplicate(&key, at, window).await.unwrap(), expected);
        }

        let other_kind = event(EventKind::Exit, "A", 0).dedup_key();
        assert!(!queue.contains_duplicate(&other_kind, t0(), window).await.unwrap());
    }

    #[tokio::test]
    async fn test_undecodable_row_is_dropped() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.event_queue();

        sqlx::query(
            r#"
            INSERT INTO event_queue (local_id, zone_code, kind, actor_id, occurred_at_ms, payload, queued_at_ms)
            VALUES ('broken', 'A', 'entry', 'u-1', 0, '{not json', 0)
            "#,
        )
        .execute(db.pool())
        .await
        .unwrap();
        let ev = event(EventKind::Entry, "B", 0);
        queue.enqueue(&ev).await.unwrap();

        let pending = queue.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.local_id, ev.local_id);
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_by_queue_age() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.event_queue();
        queue.enqueue(&event(EventKind::Entry, "A", 0)).await.unwrap();

        assert_eq!(queue.purge_older_than(Utc::now() - Duration::days(7)).await.unwrap(), 0);
        assert_eq!(queue.purge_older_than(Utc::now() + Duration::seconds(1)).await.unwrap(), 1);
        assert_eq!(queue.count().await.unwrap(), 0);
    }
}
