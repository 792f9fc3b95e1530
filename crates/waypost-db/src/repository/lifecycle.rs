//! # Device Lifecycle Repository
//!
//! One row holding the heartbeat record and the shutdown state.
//!
//! ## Session Timeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  start ──► heartbeat() + shutdown_state()   (previous session's view)  │
//! │        ──► recovery check (may commit_shutdown)                        │
//! │        ──► arm_session(now)   was_running=1, processed=0, boot=now     │
//! │                                                                         │
//! │  every 30 s ──► beat(now)                                              │
//! │                                                                         │
//! │  shutdown signal ──► commit_shutdown(...)   processed=1, exits queued  │
//! │  missed shutdown ──► claim_recovery(...)    only while processed=0     │
//! │        each writes state, exits and cleared membership in ONE tx       │
//! │  entry confirmed ──► rearm_shutdown()       processed=0                 │
//! │                                                                         │
//! │  clean stop ──► mark_stopped(now)   was_running=0                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use waypost_core::event::PresenceEvent;
use waypost_core::lifecycle::{HeartbeatRecord, ShutdownState};

use super::event_queue::insert_event;
use super::membership::write_track;
use super::{from_millis, to_millis};
use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct LifecycleRow {
    last_beat_ms: Option<i64>,
    was_running: bool,
    last_boot_ms: Option<i64>,
    shutdown_processed: bool,
    shutdown_reason: Option<String>,
    shutdown_ms: Option<i64>,
    shutdown_recovery: bool,
}

/// Repository for the device lifecycle row.
#[derive(Debug, Clone)]
pub struct LifecycleRepository {
    pool: SqlitePool,
}

impl LifecycleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LifecycleRepository { pool }
    }

    async fn row(&self) -> DbResult<LifecycleRow> {
        sqlx::query_as::<_, LifecycleRow>(
            r#"
            SELECT last_beat_ms, was_running, last_boot_ms,
                   shutdown_processed, shutdown_reason, shutdown_ms, shutdown_recovery
            FROM device_lifecycle
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::not_found("device_lifecycle", "1"))
    }

    pub async fn heartbeat(&self) -> DbResult<HeartbeatRecord> {
        let row = self.row().await?;
        Ok(HeartbeatRecord {
            last_beat_at: from_millis(row.last_beat_ms),
            was_running: row.was_running,
            last_boot_at: from_millis(row.last_boot_ms),
        })
    }

    pub async fn shutdown_state(&self) -> DbResult<ShutdownState> {
        let row = self.row().await?;
        Ok(ShutdownState {
            last_reason: row.shutdown_reason,
            last_at: from_millis(row.shutdown_ms),
            processed: row.shutdown_processed,
            recovery: row.shutdown_recovery,
        })
    }

    /// Stamps liveness.
    pub async fn beat(&self, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE device_lifecycle SET last_beat_ms = ?1, was_running = 1 WHERE id = 1")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Starts a session: running, shutdown not yet processed, fresh beat
    /// and boot time.
    pub async fn arm_session(&self, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE device_lifecycle SET
                last_beat_ms = ?1,
                last_boot_ms = ?1,
                was_running = 1,
                shutdown_processed = 0
            WHERE id = 1
            "#,
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        info!("Lifecycle session armed");
        Ok(())
    }

    /// Re-opens shutdown processing inside a running session, after a
    /// forced exit that did not end the process.
    pub async fn rearm_shutdown(&self) -> DbResult<()> {
        sqlx::query("UPDATE device_lifecycle SET shutdown_processed = 0 WHERE id = 1")
            .execute(&self.pool)
            .await?;
        debug!("Shutdown processing re-armed");
        Ok(())
    }

    /// Records a clean stop so the next start skips recovery.
    pub async fn mark_stopped(&self, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE device_lifecycle SET was_running = 0, last_beat_ms = ?1 WHERE id = 1")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;
        info!("Lifecycle marked stopped");
        Ok(())
    }

    /// Stores an observed shutdown: the shutdown state, every forced exit in
    /// the offline queue, and the cleared membership rows, in one
    /// transaction. Always written, whatever the session's processed flag.
    pub async fn commit_shutdown(
        &self,
        state: &ShutdownState,
        events: &[PresenceEvent],
        cleared_zones: &[String],
    ) -> DbResult<()> {
        self.commit(state, events, cleared_zones, false).await?;
        Ok(())
    }

    /// Same as [`commit_shutdown`](Self::commit_shutdown) for an inferred
    /// shutdown, but only while processing is armed. Claims `processed 0→1`
    /// and returns false without writing anything when it was already set.
    pub async fn claim_recovery(
        &self,
        state: &ShutdownState,
        events: &[PresenceEvent],
        cleared_zones: &[String],
    ) -> DbResult<bool> {
        self.commit(state, events, cleared_zones, true).await
    }

    async fn commit(
        &self,
        state: &ShutdownState,
        events: &[PresenceEvent],
        cleared_zones: &[String],
        only_if_armed: bool,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE device_lifecycle SET
                shutdown_processed = 1,
                shutdown_reason = ?1,
                shutdown_ms = ?2,
                shutdown_recovery = ?3
            WHERE id = 1 AND (?4 = 0 OR shutdown_processed = 0)
            "#,
        )
        .bind(&state.last_reason)
        .bind(state.last_at.map(to_millis))
        .bind(state.recovery)
        .bind(only_if_armed)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !claimed {
            tx.rollback().await?;
            debug!("Shutdown already processed for this session");
            return Ok(false);
        }

        for event in events {
            insert_event(&mut tx, event).await?;
        }
        for code in cleared_zones {
            write_track(&mut tx, code, None).await?;
        }

        tx.commit().await?;
        info!(
            events = events.len(),
            recovery = state.recovery,
            "Shutdown committed"
        );
        Ok(true)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
