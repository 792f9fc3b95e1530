//! # Zone Registry Service
//!
//! Keeps the active zone set current: local cache at startup, remote fetch
//! with retry, daily refresh, and snapshots pushed by the remote store.
//!
//! ## Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  startup ──► zone_cache.load_all() ──► registry (may be empty)         │
//! │          ──► fetch_active_zones(tenant), exponential backoff           │
//! │                                                                         │
//! │  every 24 h ──► fetch_active_zones(tenant)                             │
//! │  subscription ──► pushed snapshot                                      │
//! │                        │                                                │
//! │                        ▼                                                │
//! │               apply_snapshot(docs)                                      │
//! │                 bad records   → warn, skip                              │
//! │                 no valid zone → keep previous set                       │
//! │                 otherwise     → replace registry + rewrite cache        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use waypost_core::zone::{Zone, ZoneRegistry};
use waypost_db::Database;

use crate::config::{RemoteSettings, TrackerConfig};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;

/// What a snapshot did to the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Applied { accepted: usize, rejected: usize },
    /// No valid zone in the snapshot; the previous set stays active.
    KeptPrevious { rejected: usize },
}

pub struct ZoneRegistryService {
    db: Arc<Database>,
    remote: Arc<dyn RemoteStore>,
    tenant: Option<String>,
    retry: RemoteSettings,
    registry: RwLock<ZoneRegistry>,
}

impl ZoneRegistryService {
    pub fn new(config: &TrackerConfig, db: Arc<Database>, remote: Arc<dyn RemoteStore>) -> Self {
        ZoneRegistryService {
            db,
            remote,
            tenant: config.actor.tenant(),
            retry: config.remote.clone(),
            registry: RwLock::new(ZoneRegistry::default()),
        }
    }

    /// Activates the cached set from the previous session.
    pub async fn load_cache(&self) -> SyncResult<usize> {
        let zones = self.db.zone_cache().load_all().await?;
        let count = zones.len();
        self.registry.write().await.replace(zones);
        info!(count, "Zones loaded from cache");
        Ok(count)
    }

    /// Fetches the tenant's active zones once.
    pub async fn refresh(&self) -> SyncResult<SnapshotOutcome> {
        let tenant = self.tenant.as_deref().ok_or(SyncError::MissingTenant)?;
        let docs = self.remote.fetch_active_zones(tenant).await?;
        debug!(records = docs.len(), "Fetched zone snapshot");
        self.apply_snapshot(&docs).await
    }

    /// `refresh` retried with exponential backoff while the failure is
    /// transient. Gives up after `remote.max_elapsed_secs`.
    pub async fn refresh_with_backoff(&self) -> SyncResult<SnapshotOutcome> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.retry.initial_backoff_ms),
            max_interval: Duration::from_secs(self.retry.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.retry.max_elapsed_secs)),
            ..Default::default()
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.refresh().await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() => match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(error = %e, attempt, ?delay, "Zone fetch failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(error = %e, attempt, "Zone fetch retries exhausted, keeping cached zones");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Validates a full snapshot and, when it holds at least one valid zone,
    /// makes it the active set and the new cache.
    pub async fn apply_snapshot(&self, docs: &[Value]) -> SyncResult<SnapshotOutcome> {
        let (zones, rejected) = ZoneRegistry::parse_snapshot(docs);
        for r in &rejected {
            warn!(index = r.index, reason = %r.reason, "Skipping malformed zone record");
        }

        if zones.is_empty() {
            warn!(rejected = rejected.len(), "Snapshot has no valid zones, keeping previous set");
            return Ok(SnapshotOutcome::KeptPrevious {
                rejected: rejected.len(),
            });
        }

        self.db.zone_cache().replace_all(&zones).await?;
        let accepted = zones.len();
        self.registry.write().await.replace(zones);

        info!(accepted, rejected = rejected.len(), "Zone set replaced");
        Ok(SnapshotOutcome::Applied {
            accepted,
            rejected: rejected.len(),
        })
    }

    pub async fn subscribe(&self) -> SyncResult<mpsc::Receiver<Vec<Value>>> {
        let tenant = self.tenant.as_deref().ok_or(SyncError::MissingTenant)?;
        self.remote.subscribe_zones(tenant).await
    }

    /// Snapshot of the active set.
    pub async fn zones(&self) -> Vec<Zone> {
        self.registry.read().await.zones().to_vec()
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Zone> {
        self.registry.read().await.find_by_name(name).cloned()
    }

    pub async fn find_by_code(&self, code: &str) -> Option<Zone> {
        self.registry.read().await.find_by_code(code).cloned()
    }
}

// =============================================================================
// Background Worker
// =============================================================================

/// Daily refresh plus the remote subscription.
pub struct ZoneWorker {
    service: Arc<ZoneRegistryService>,
    refresh_interval: Duration,
    subscription: Option<mpsc::Receiver<Vec<Value>>>,
    shutdown_rx: mpsc::Receiver<()>,
}

#[derive(Clone)]
pub struct ZoneWorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl ZoneWorkerHandle {
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|e| SyncError::ChannelError(e.to_string()))
    }
}

impl ZoneWorker {
    pub fn new(
        config: &TrackerConfig,
        service: Arc<ZoneRegistryService>,
        subscription: Option<mpsc::Receiver<Vec<Value>>>,
    ) -> (Self, ZoneWorkerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = ZoneWorker {
            service,
            refresh_interval: Duration::from_secs(config.zones.refresh_interval_secs),
            subscription,
            shutdown_rx,
        };
        (worker, ZoneWorkerHandle { shutdown_tx })
    }

    pub async fn run(mut self) {
        info!(interval = ?self.refresh_interval, subscribed = self.subscription.is_some(), "Zone worker starting");

        // Startup already fetched; first periodic refresh is one interval out
        let mut refresh = tokio::time::interval_at(
            tokio::time::Instant::now() + self.refresh_interval,
            self.refresh_interval,
        );
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    if let Err(e) = self.service.refresh().await {
                        error!(?e, "Periodic zone refresh failed");
                    }
                }

                snapshot = next_snapshot(&mut self.subscription) => match snapshot {
                    Some(docs) => {
                        if let Err(e) = self.service.apply_snapshot(&docs).await {
                            error!(?e, "Failed to apply pushed zone snapshot");
                        }
                    }
                    None => {
                        warn!("Zone subscription closed");
                        self.subscription = None;
                    }
                },

                _ = self.shutdown_rx.recv() => {
                    info!("Zone worker shutting down");
                    break;
                }
            }
        }
    }
}

async fn next_snapshot(subscription: &mut Option<mpsc::Receiver<Vec<Value>>>) -> Option<Vec<Value>> {
    match subscription {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemoteStore;
    use crate::testing::{config_with_tenant, memory_db, zone_doc};
    use serde_json::json;

    async fn service(tenant: Option<&str>) -> (ZoneRegistryService, Arc<Database>, Arc<InMemoryRemoteStore>) {
        let mut config = config_with_tenant(tenant);
        config.remote.max_elapsed_secs = 0;
        let db = memory_db().await;
        let remote = Arc::new(InMemoryRemoteStore::new());
        (ZoneRegistryService::new(&config, db.clone(), remote.clone()), db, remote)
    }

    #[tokio::test]
    async fn test_refresh_skips_bad_records_and_fills_cache() {
        let (svc, db, remote) = service(Some("acme")).await;
        remote
            .set_zones(
                "acme",
                vec![
                    zone_doc("A", -23.55, -46.63, 100.0),
                    json!({"code": "X", "name": "Null Island", "latitude": 0.0, "longitude": 0.0}),
                    zone_doc("B", -23.56, -46.64, 50.0),
                ],
            )
            .await;

        let outcome = svc.refresh().await.unwrap();
        assert_eq!(outcome, SnapshotOutcome::Applied { accepted: 2, rejected: 1 });
        assert_eq!(svc.len().await, 2);
        assert_eq!(db.zone_cache().load_all().await.unwrap(), svc.zones().await);
        assert_eq!(svc.find_by_name("Zone B").await.map(|z| z.code), Some("B".into()));
    }

    #[tokio::test]
    async fn test_empty_snapshot_keeps_previous_set() {
        let (svc, _db, _remote) = service(Some("acme")).await;
        svc.apply_snapshot(&[zone_doc("A", 10.0, 10.0, 100.0)]).await.unwrap();

        let outcome = svc.apply_snapshot(&[json!({"name": "no code"})]).await.unwrap();
        assert_eq!(outcome, SnapshotOutcome::KeptPrevious { rejected: 1 });
        assert_eq!(svc.find_by_code("A").await.map(|z| z.radius_m), Some(100.0));
    }

    #[tokio::test]
    async fn test_cache_survives_into_next_session() {
        let (svc, db, remote) = service(Some("acme")).await;
        svc.apply_snapshot(&[zone_doc("A", 10.0, 10.0, 80.0)]).await.unwrap();

        let next = ZoneRegistryService::new(&config_with_tenant(Some("acme")), db, remote);
        assert_eq!(next.load_cache().await.unwrap(), 1);
        assert_eq!(next.zones().await, svc.zones().await);
    }

    #[tokio::test]
    async fn test_refresh_without_tenant_or_connection() {
        let (svc, _db, _remote) = service(None).await;
        assert!(matches!(svc.refresh().await, Err(SyncError::MissingTenant)));
        assert!(matches!(svc.refresh_with_backoff().await, Err(SyncError::MissingTenant)));

        let (svc, _db, remote) = service(Some("acme")).await;
        remote.set_unavailable(true).await;
        let err = svc.refresh_with_backoff().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(svc.zones().await.is_empty());
    }

    #[tokio::test]
    async fn test_worker_applies_pushed_snapshots() {
        let config = config_with_tenant(Some("acme"));
        let (svc, _db, remote) = service(Some("acme")).await;
        let svc = Arc::new(svc);
        let subscription = svc.subscribe().await.unwrap();

        let (worker, handle) = ZoneWorker::new(&config, svc.clone(), Some(subscription));
        let task = tokio::spawn(worker.run());

        remote.push_zones("acme", vec![zone_doc("P", 5.0, 5.0, 30.0)]).await;
        for _ in 0..50 {
            if svc.len().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(svc.find_by_code("P").await.map(|z| z.radius_m), Some(30.0));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
