//! # Event Emitter
//!
//! Delivers presence and provider-status events: straight to the remote
//! store when possible, into the offline queue otherwise.
//!
//! ## Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  emit(event)                                                            │
//! │     tenant && online ──► remote dedup check ── dup ──► RemoteDuplicate │
//! │                                │ unique                                 │
//! │                                ▼                                        │
//! │                          remote add ── ok ──► Uploaded                  │
//! │                                │ any error                              │
//! │                                ▼                                        │
//! │                          offline queue ─────► Queued                    │
//! │     otherwise ──► local dedup check ── dup ──► LocalDuplicate           │
//! │                                └─ unique ────► Queued                   │
//! │                                                                         │
//! │  emit_local_first(event)                                                │
//! │     offline queue first, then a drain when online                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tracing::{debug, warn};

use waypost_core::event::{DedupWindow, PresenceEvent, ProviderStatusEvent};
use waypost_db::Database;

use crate::config::TrackerConfig;
use crate::connectivity::Connectivity;
use crate::error::SyncResult;
use crate::remote::RemoteStore;
use crate::sync_engine::{upload_event, DrainOutcome, SyncEngine, Upload};

/// Where an emitted event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Uploaded,
    /// The remote store already had it; nothing was written.
    RemoteDuplicate,
    Queued,
    /// The offline queue already had it; nothing was written.
    LocalDuplicate,
}

pub struct EventEmitter {
    db: Arc<Database>,
    remote: Arc<dyn RemoteStore>,
    engine: Arc<SyncEngine>,
    connectivity: Connectivity,
    tenant: Option<String>,
    window: DedupWindow,
}

impl EventEmitter {
    pub fn new(
        config: &TrackerConfig,
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        engine: Arc<SyncEngine>,
        connectivity: Connectivity,
    ) -> Self {
        EventEmitter {
            db,
            remote,
            engine,
            connectivity,
            tenant: config.actor.tenant(),
            window: config.dedup.window(),
        }
    }

    fn remote_tenant(&self) -> Option<&str> {
        if self.connectivity.is_online() {
            self.tenant.as_deref()
        } else {
            None
        }
    }

    /// Online-first delivery with offline fallback.
    pub async fn emit(&self, event: &PresenceEvent) -> SyncResult<EmitOutcome> {
        let Some(tenant) = self.remote_tenant() else {
            return self.enqueue_unique(event).await;
        };

        match upload_event(self.remote.as_ref(), tenant, event, self.window).await {
            Ok(Upload::Added) => {
                debug!(zone = %event.zone_code, kind = %event.kind, "Event uploaded");
                Ok(EmitOutcome::Uploaded)
            }
            Ok(Upload::Duplicate) => {
                debug!(zone = %event.zone_code, kind = %event.kind, "Remote duplicate, skipping");
                Ok(EmitOutcome::RemoteDuplicate)
            }
            Err(e) => {
                warn!(error = %e, zone = %event.zone_code, kind = %event.kind, "Remote write failed, queueing locally");
                self.db.event_queue().enqueue(event).await?;
                Ok(EmitOutcome::Queued)
            }
        }
    }

    /// Writes the event to the offline queue before anything else, then
    /// drains when a connection is available.
    pub async fn emit_local_first(&self, event: &PresenceEvent) -> SyncResult<DrainOutcome> {
        self.db.event_queue().enqueue(event).await?;
        debug!(zone = %event.zone_code, kind = %event.kind, "Event queued locally first");
        self.engine.drain().await
    }

    /// Online-first delivery of a provider status change.
    pub async fn emit_provider_status(&self, event: &ProviderStatusEvent) -> SyncResult<EmitOutcome> {
        if let Some(tenant) = self.remote_tenant() {
            match self.remote.add_provider_event(tenant, event).await {
                Ok(()) => return Ok(EmitOutcome::Uploaded),
                Err(e) => warn!(error = %e, kind = event.kind(), "Provider status upload failed, queueing"),
            }
        }
        self.db.provider_events().enqueue(event).await?;
        Ok(EmitOutcome::Queued)
    }

    async fn enqueue_unique(&self, event: &PresenceEvent) -> SyncResult<EmitOutcome> {
        let queue = self.db.event_queue();

        let duplicate = queue
            .contains_duplicate(&event.dedup_key(), event.occurred_at, self.window)
            .await
            .unwrap_or_else(|e| {
                warn!(?e, "Local dedup check failed, queueing anyway");
                false
            });
        if duplicate {
            debug!(zone = %event.zone_code, kind = %event.kind, "Local duplicate, skipping");
            return Ok(EmitOutcome::LocalDuplicate);
        }

        queue.enqueue(event).await?;
        Ok(EmitOutcome::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemoteStore;
    use crate::testing::{config_with_tenant, memory_db, presence_event, t0};
    use waypost_core::event::{Actor, EventKind};

    struct Fixture {
        emitter: EventEmitter,
        db: Arc<Database>,
        remote: Arc<InMemoryRemoteStore>,
        connectivity: Connectivity,
    }

    async fn fixture(tenant: Option<&str>, online: bool) -> Fixture {
        let config = config_with_tenant(tenant);
        let db = memory_db().await;
        let remote = Arc::new(InMemoryRemoteStore::new());
        let connectivity = Connectivity::new(online);
        let engine = Arc::new(SyncEngine::new(
            &config,
            db.clone(),
            remote.clone(),
            connectivity.clone(),
        ));
        let emitter = EventEmitter::new(&config, db.clone(), remote.clone(), engine, connectivity.clone());
        Fixture {
            emitter,
            db,
            remote,
            connectivity,
        }
    }

    #[tokio::test]
    async fn test_online_emit_uploads_then_detects_duplicate() {
        let f = fixture(Some("acme"), true).await;
        let first = presence_event(EventKind::Entry, "A", 0);
        assert_eq!(f.emitter.emit(&first).await.unwrap(), EmitOutcome::Uploaded);

        let again = presence_event(EventKind::Entry, "A", 90);
        assert_eq!(f.emitter.emit(&again).await.unwrap(), EmitOutcome::RemoteDuplicate);
        assert_eq!(f.remote.write_count().await, 1);
        assert!(!f.remote.events().await[0].event.offline_sync);
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_queue() {
        let f = fixture(Some("acme"), true).await;
        f.remote.set_unavailable(true).await;

        let event = presence_event(EventKind::Exit, "A", 0);
        assert_eq!(f.emitter.emit(&event).await.unwrap(), EmitOutcome::Queued);
        assert_eq!(f.db.event_queue().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_offline_emit_skips_local_duplicates() {
        let f = fixture(Some("acme"), false).await;
        let first = presence_event(EventKind::Entry, "A", 0);
        assert_eq!(f.emitter.emit(&first).await.unwrap(), EmitOutcome::Queued);

        let again = presence_event(EventKind::Entry, "A", -30);
        assert_eq!(f.emitter.emit(&again).await.unwrap(), EmitOutcome::LocalDuplicate);

        let exit = presence_event(EventKind::Exit, "A", 10);
        assert_eq!(f.emitter.emit(&exit).await.unwrap(), EmitOutcome::Queued);
        assert_eq!(f.db.event_queue().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_without_tenant_everything_stays_local() {
        let f = fixture(None, true).await;
        let event = presence_event(EventKind::Entry, "A", 0);
        assert_eq!(f.emitter.emit(&event).await.unwrap(), EmitOutcome::Queued);
        assert_eq!(f.remote.write_count().await, 0);

        let status = ProviderStatusEvent::new(true, &Actor::new("u-1", "Ana"), t0());
        assert_eq!(f.emitter.emit_provider_status(&status).await.unwrap(), EmitOutcome::Queued);
        assert_eq!(f.db.provider_events().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_local_first_drains_when_online() {
        let f = fixture(Some("acme"), false).await;
        let event = presence_event(EventKind::AutoExit, "A", 0);
        assert_eq!(
            f.emitter.emit_local_first(&event).await.unwrap(),
            DrainOutcome::Offline
        );
        assert_eq!(f.db.event_queue().count().await.unwrap(), 1);

        f.connectivity.set(true);
        let next = presence_event(EventKind::Entry, "B", 60);
        let outcome = f.emitter.emit_local_first(&next).await.unwrap();
        assert_eq!(outcome.report().map(|r| r.uploaded), Some(2));
        assert_eq!(f.db.event_queue().count().await.unwrap(), 0);
    }
}
