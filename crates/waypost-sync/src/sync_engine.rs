//! # Sync Engine
//!
//! Moves queued events to the remote store, one at a time, oldest first.
//!
//! ## Drain Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncEngine::drain                              │
//! │                                                                         │
//! │  try_lock(gate) ── busy ──► AlreadyRunning (trigger dropped)           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  tenant? online? ── no ──► NoTenant / Offline                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  for entry in event_queue (seq order, paged):                           │
//! │       remote duplicate?  ── yes ──► remove                 (duplicates) │
//! │       add(offline_sync=true)                                            │
//! │            ok           ──────────► remove                 (uploaded)   │
//! │            Unavailable  ──────────► STOP, entry stays queued            │
//! │            Rejected     ──────────► record_failure, next   (failed)     │
//! │                                                                         │
//! │  then the provider status queue, same rules without the dedup check     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Worker Timing
//! - Drain: on start, every `sync.interval_secs` (5 min), and on trigger
//! - Cleanup: 1 h after start, then every 24 h; purges entries queued more
//!   than `sync.retention_days` ago

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use waypost_core::event::{DedupWindow, PresenceEvent};
use waypost_db::Database;

use crate::config::TrackerConfig;
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;

// =============================================================================
// Reports
// =============================================================================

/// Counts from one completed drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Presence events written remotely.
    pub uploaded: usize,
    /// Presence events the remote store already had.
    pub duplicates: usize,
    /// Entries refused permanently this pass; they stay queued.
    pub failed: usize,
    pub provider_uploaded: usize,
    /// True when a transient failure ended the pass early.
    pub interrupted: bool,
    /// Entries left in both queues afterwards.
    pub remaining: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another pass holds the gate.
    AlreadyRunning,
    Offline,
    NoTenant,
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Result of pushing one presence event through the remote dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upload {
    Added,
    Duplicate,
}

/// Dedup check, then add. Shared by the drain and the online emit path.
pub(crate) async fn upload_event(
    remote: &dyn RemoteStore,
    tenant: &str,
    event: &PresenceEvent,
    window: DedupWindow,
) -> SyncResult<Upload> {
    if remote.has_duplicate(tenant, event, window).await? {
        return Ok(Upload::Duplicate);
    }
    remote.add_event(tenant, event).await?;
    Ok(Upload::Added)
}

// =============================================================================
// Engine
// =============================================================================

pub struct SyncEngine {
    db: Arc<Database>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Connectivity,
    tenant: Option<String>,
    window: DedupWindow,
    batch_size: u32,
    retention: ChronoDuration,
    gate: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        config: &TrackerConfig,
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
    ) -> Self {
        SyncEngine {
            db,
            remote,
            connectivity,
            tenant: config.actor.tenant(),
            window: config.dedup.window(),
            batch_size: config.sync.batch_size,
            retention: config.retention(),
            gate: Mutex::new(()),
        }
    }

    /// Runs one pass over both queues unless one is already in progress.
    pub async fn drain(&self) -> SyncResult<DrainOutcome> {
        let _guard = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Drain already running, skipping trigger");
                return Ok(DrainOutcome::AlreadyRunning);
            }
        };

        let Some(tenant) = self.tenant.as_deref() else {
            debug!("No tenant configured, events stay queued");
            return Ok(DrainOutcome::NoTenant);
        };

        if !self.connectivity.is_online() {
            debug!("Offline, skipping drain");
            return Ok(DrainOutcome::Offline);
        }

        let mut report = DrainReport::default();
        self.drain_events(tenant, &mut report).await?;
        if !report.interrupted {
            self.drain_provider_events(tenant, &mut report).await?;
        }

        report.remaining = self.queued().await;

        if report.uploaded + report.duplicates + report.failed + report.provider_uploaded > 0 {
            info!(
                uploaded = report.uploaded,
                duplicates = report.duplicates,
                failed = report.failed,
                provider_uploaded = report.provider_uploaded,
                remaining = report.remaining,
                interrupted = report.interrupted,
                "Offline queue drained"
            );
        }

        Ok(DrainOutcome::Completed(report))
    }

    async fn drain_events(&self, tenant: &str, report: &mut DrainReport) -> SyncResult<()> {
        let queue = self.db.event_queue();
        let mut after_seq = 0;

        loop {
            let batch = match queue.pending_after(after_seq, self.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(?e, "Failed to read offline queue, treating as empty");
                    return Ok(());
                }
            };
            if batch.is_empty() {
                return Ok(());
            }

            for entry in batch {
                after_seq = entry.seq;
                let mut event = entry.event;
                event.offline_sync = true;

                match upload_event(self.remote.as_ref(), tenant, &event, self.window).await {
                    Ok(Upload::Added) => {
                        queue.remove(&event.local_id).await?;
                        report.uploaded += 1;
                    }
                    Ok(Upload::Duplicate) => {
                        debug!(local_id = %event.local_id, zone = %event.zone_code, "Already stored remotely, dropping");
                        queue.remove(&event.local_id).await?;
                        report.duplicates += 1;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, local_id = %event.local_id, "Remote unavailable, stopping drain");
                        report.interrupted = true;
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(error = %e, local_id = %event.local_id, attempts = entry.attempts + 1, "Queued event rejected");
                        queue.record_failure(&event.local_id, &e.to_string()).await?;
                        report.failed += 1;
                    }
                }
            }
        }
    }

    async fn drain_provider_events(&self, tenant: &str, report: &mut DrainReport) -> SyncResult<()> {
        let queue = self.db.provider_events();
        let mut after_seq = 0;

        loop {
            let batch = match queue.pending_after(after_seq, self.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(?e, "Failed to read provider status queue, treating as empty");
                    return Ok(());
                }
            };
            if batch.is_empty() {
                return Ok(());
            }

            for entry in batch {
                after_seq = entry.seq;
                match self.remote.add_provider_event(tenant, &entry.event).await {
                    Ok(()) => {
                        queue.remove(&entry.event.local_id).await?;
                        report.provider_uploaded += 1;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "Remote unavailable, stopping provider drain");
                        report.interrupted = true;
                        return Ok(());
                    }
                    Err(e) => {
                        queue.record_failure(&entry.event.local_id, &e.to_string()).await?;
                        report.failed += 1;
                    }
                }
            }
        }
    }

    async fn queued(&self) -> i64 {
        let events = self.db.event_queue().count().await.unwrap_or(0);
        let provider = self.db.provider_events().count().await.unwrap_or(0);
        events + provider
    }

    /// Purges entries queued before `now - retention` from both queues.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        let cutoff = now - self.retention;
        let purged = self.db.event_queue().purge_older_than(cutoff).await?
            + self.db.provider_events().purge_older_than(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "Purged expired queue entries");
        }
        Ok(purged)
    }
}

// =============================================================================
// Background Worker
// =============================================================================

/// Periodic and on-demand drains plus daily cleanup.
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    interval: Duration,
    cleanup_delay: Duration,
    cleanup_interval: Duration,
    trigger_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for controlling the sync worker.
#[derive(Clone)]
pub struct SyncWorkerHandle {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl SyncWorkerHandle {
    /// Requests a drain. Coalesces with one already pending.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|e| SyncError::ChannelError(e.to_string()))
    }
}

impl SyncWorker {
    pub fn new(config: &TrackerConfig, engine: Arc<SyncEngine>) -> (Self, SyncWorkerHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let worker = SyncWorker {
            engine,
            interval: config.sync_interval(),
            cleanup_delay: Duration::from_secs(config.sync.cleanup_initial_delay_secs),
            cleanup_interval: Duration::from_secs(config.sync.cleanup_interval_secs),
            trigger_rx,
            shutdown_rx,
        };

        (worker, SyncWorkerHandle { trigger_tx, shutdown_tx })
    }

    pub async fn run(mut self) {
        info!(interval = ?self.interval, "Sync worker starting");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut cleanup = tokio::time::interval_at(
            tokio::time::Instant::now() + self.cleanup_delay,
            self.cleanup_interval,
        );
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.drain().await,

                Some(()) = self.trigger_rx.recv() => self.drain().await,

                _ = cleanup.tick() => {
                    if let Err(e) = self.engine.cleanup(Utc::now()).await {
                        error!(?e, "Queue cleanup failed");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Sync worker shutting down");
                    break;
                }
            }
        }

        info!("Sync worker stopped");
    }

    async fn drain(&self) {
        if let Err(e) = self.engine.drain().await {
            error!(?e, "Drain pass failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
