//! # Remote Store
//!
//! The shared, tenant-partitioned store that receives presence events and
//! serves the zone set.
//!
//! ## Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         RemoteStore (trait)                             │
//! │                                                                         │
//! │  has_duplicate(tenant, event, window)  same zone/kind/actor within ±w  │
//! │  add_event(tenant, event)              append one presence event        │
//! │  add_provider_event(tenant, event)     append one provider status event │
//! │  fetch_active_zones(tenant)            full snapshot of active zones    │
//! │  subscribe_zones(tenant)               stream of later snapshots        │
//! │                                                                         │
//! │  Errors: Unavailable / Timeout  → retry later, keep the entry queued    │
//! │          Rejected               → payload refused, retrying won't help │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Zone documents come back as raw JSON; validation happens in
//! [`waypost_core::zone::ZoneRegistry::parse_snapshot`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use waypost_core::event::{is_duplicate, DedupWindow, PresenceEvent, ProviderStatusEvent};

use crate::error::{SyncError, SyncResult};

/// Capacity of each zone subscription channel.
const SUBSCRIPTION_BUFFER: usize = 8;

// =============================================================================
// Trait
// =============================================================================

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// True when an event with the same zone, kind and actor already exists
    /// within `window` of `event.occurred_at`.
    async fn has_duplicate(
        &self,
        tenant: &str,
        event: &PresenceEvent,
        window: DedupWindow,
    ) -> SyncResult<bool>;

    async fn add_event(&self, tenant: &str, event: &PresenceEvent) -> SyncResult<()>;

    async fn add_provider_event(&self, tenant: &str, event: &ProviderStatusEvent) -> SyncResult<()>;

    /// Active zone documents for the tenant.
    async fn fetch_active_zones(&self, tenant: &str) -> SyncResult<Vec<Value>>;

    /// Receives a full snapshot every time the tenant's zone set changes.
    async fn subscribe_zones(&self, tenant: &str) -> SyncResult<mpsc::Receiver<Vec<Value>>>;
}

// =============================================================================
// Request Timeout
// =============================================================================

/// Bounds every call of the wrapped store, so a hung connection surfaces as
/// a retryable `Timeout` instead of stalling the caller.
pub struct TimeoutRemoteStore {
    inner: Arc<dyn RemoteStore>,
    timeout: Duration,
}

impl TimeoutRemoteStore {
    pub fn new(inner: Arc<dyn RemoteStore>, timeout: Duration) -> Self {
        TimeoutRemoteStore { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        call: &'static str,
        request: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                let millis = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(call, timeout_ms = millis, "Remote call timed out");
                Err(SyncError::Timeout(millis))
            }
        }
    }
}

#[async_trait]
impl RemoteStore for TimeoutRemoteStore {
    async fn has_duplicate(
        &self,
        tenant: &str,
        event: &PresenceEvent,
        window: DedupWindow,
    ) -> SyncResult<bool> {
        self.bounded("has_duplicate", self.inner.has_duplicate(tenant, event, window))
            .await
    }

    async fn add_event(&self, tenant: &str, event: &PresenceEvent) -> SyncResult<()> {
        self.bounded("add_event", self.inner.add_event(tenant, event)).await
    }

    async fn add_provider_event(&self, tenant: &str, event: &ProviderStatusEvent) -> SyncResult<()> {
        self.bounded("add_provider_event", self.inner.add_provider_event(tenant, event))
            .await
    }

    async fn fetch_active_zones(&self, tenant: &str) -> SyncResult<Vec<Value>> {
        self.bounded("fetch_active_zones", self.inner.fetch_active_zones(tenant))
            .await
    }

    async fn subscribe_zones(&self, tenant: &str) -> SyncResult<mpsc::Receiver<Vec<Value>>> {
        self.bounded("subscribe_zones", self.inner.subscribe_zones(tenant))
            .await
    }
}

// =============================================================================
// In-Memory Implementation
// =============================================================================

/// A presence event as the remote store holds it.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub document_id: String,
    pub tenant: String,
    #[serde(flatten)]
    pub event: PresenceEvent,
}

#[derive(Default)]
struct RemoteState {
    zones: HashMap<String, Vec<Value>>,
    events: Vec<StoredEvent>,
    provider_events: Vec<(String, ProviderStatusEvent)>,
    subscribers: HashMap<String, Vec<mpsc::Sender<Vec<Value>>>>,
    rejected_zones: HashSet<String>,
    unavailable: bool,
    latency: Option<Duration>,
    writes: usize,
}

/// Process-local remote store. Backs the replay tool and the tests, and can
/// simulate outages, slow responses and refused writes.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<RemoteState>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the tenant's zone documents without notifying subscribers.
    pub async fn set_zones(&self, tenant: &str, docs: Vec<Value>) {
        self.state.lock().await.zones.insert(tenant.to_string(), docs);
    }

    /// Replaces the tenant's zones and pushes the snapshot to subscribers.
    pub async fn push_zones(&self, tenant: &str, docs: Vec<Value>) {
        let mut state = self.state.lock().await;
        state.zones.insert(tenant.to_string(), docs.clone());
        if let Some(subs) = state.subscribers.get_mut(tenant) {
            subs.retain(|tx| !matches!(tx.try_send(docs.clone()), Err(TrySendError::Closed(_))));
        }
    }

    /// Simulates losing (or regaining) the connection.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Delays every later call by `latency` before it is answered.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    async fn respond_after_latency(&self) {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Makes every later write for `zone_code` fail with `Rejected`.
    pub async fn reject_zone(&self, zone_code: &str) {
        self.state
            .lock()
            .await
            .rejected_zones
            .insert(zone_code.to_string());
    }

    pub async fn events(&self) -> Vec<StoredEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn provider_events(&self) -> Vec<ProviderStatusEvent> {
        self.state
            .lock()
            .await
            .provider_events
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Successful writes so far.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    fn check_available(state: &RemoteState) -> SyncResult<()> {
        if state.unavailable {
            return Err(SyncError::Unavailable("remote store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn has_duplicate(
        &self,
        tenant: &str,
        event: &PresenceEvent,
        window: DedupWindow,
    ) -> SyncResult<bool> {
        self.respond_after_latency().await;
        let state = self.state.lock().await;
        Self::check_available(&state)?;
        Ok(state
            .events
            .iter()
            .any(|stored| stored.tenant == tenant && is_duplicate(&stored.event, event, window)))
    }

    async fn add_event(&self, tenant: &str, event: &PresenceEvent) -> SyncResult<()> {
        self.respond_after_latency().await;
        let mut state = self.state.lock().await;
        Self::check_available(&state)?;
        if state.rejected_zones.contains(&event.zone_code) {
            return Err(SyncError::Rejected(format!(
                "writes to zone {} are not permitted",
                event.zone_code
            )));
        }

        let document_id = Uuid::new_v4().to_string();
        debug!(%document_id, zone = %event.zone_code, kind = %event.kind, "Remote event stored");
        state.events.push(StoredEvent {
            document_id,
            tenant: tenant.to_string(),
            event: event.clone(),
        });
        state.writes += 1;
        Ok(())
    }

    async fn add_provider_event(&self, tenant: &str, event: &ProviderStatusEvent) -> SyncResult<()> {
        self.respond_after_latency().await;
        let mut state = self.state.lock().await;
        Self::check_available(&state)?;
        state.provider_events.push((tenant.to_string(), event.clone()));
        state.writes += 1;
        Ok(())
    }

    async fn fetch_active_zones(&self, tenant: &str) -> SyncResult<Vec<Value>> {
        self.respond_after_latency().await;
        let state = self.state.lock().await;
        Self::check_available(&state)?;
        Ok(state.zones.get(tenant).cloned().unwrap_or_default())
    }

    async fn subscribe_zones(&self, tenant: &str) -> SyncResult<mpsc::Receiver<Vec<Value>>> {
        self.respond_after_latency().await;
        let mut state = self.state.lock().await;
        Self::check_available(&state)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        state
            .subscribers
            .entry(tenant.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use serde_json::json;
    use waypost_core::confirmation::{Transition, TransitionReason};
    use waypost_core::event::{Actor, EventKind};
    use waypost_core::geo::Position;

    fn event(zone: &str, secs: i64) -> PresenceEvent {
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let transition = Transition {
            kind: EventKind::Entry,
            zone_code: zone.to_string(),
            position: Position::new(1.0, 1.0),
            at: t0 + chrono::Duration::seconds(secs),
            reason: TransitionReason::Confirmed,
        };
        PresenceEvent::from_transition(&transition, None, &Actor::new("u-1", "Ana"), 5.0)
    }

    #[tokio::test]
    async fn test_duplicates_are_tenant_scoped() {
        let store = InMemoryRemoteStore::new();
        store.add_event("acme", &event("A", 0)).await.unwrap();

        let window = DedupWindow::default();
        assert!(store.has_duplicate("acme", &event("A", 60), window).await.unwrap());
        assert!(!store.has_duplicate("globex", &event("A", 60), window).await.unwrap());
        assert!(!store.has_duplicate("acme", &event("A", 500), window).await.unwrap());
    }

    #[tokio::test]
    async fn test_outage_and_rejection() {
        let store = InMemoryRemoteStore::new();
        store.set_unavailable(true).await;
        let err = store.add_event("acme", &event("A", 0)).await.unwrap_err();
        assert!(err.is_retryable());

        store.set_unavailable(false).await;
        store.reject_zone("B").await;
        let err = store.add_event("acme", &event("B", 0)).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscription_receives_snapshots() {
        let store = InMemoryRemoteStore::new();
        let mut rx = store.subscribe_zones("acme").await.unwrap();

        let docs = vec![json!({"code": "A", "name": "A", "latitude": 1.0, "longitude": 1.0, "radius": 50})];
        store.push_zones("acme", docs.clone()).await;

        assert_eq!(rx.recv().await.unwrap(), docs);
        assert_eq!(store.fetch_active_zones("acme").await.unwrap(), docs);
    }

    #[tokio::test]
    async fn test_slow_calls_time_out() {
        let slow = Arc::new(InMemoryRemoteStore::new());
        slow.set_latency(Some(Duration::from_secs(30))).await;
        let store = TimeoutRemoteStore::new(slow.clone(), Duration::from_millis(50));

        let started = std::time::Instant::now();
        let err = store
            .has_duplicate("acme", &event("A", 0), DedupWindow::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout(50)));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(5));

        slow.set_latency(None).await;
        store.add_event("acme", &event("A", 0)).await.unwrap();
        assert_eq!(slow.write_count().await, 1);
    }
}
