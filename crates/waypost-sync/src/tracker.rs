//! # Presence Tracker
//!
//! The orchestrator. Owns the presence state and wires the registry, the
//! emitter, the sync engine, the heartbeat monitor and the shutdown handler
//! together.
//!
//! ## Fix Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Fix ──► validate ── invalid ──► warn, ignored                         │
//! │            │                                                            │
//! │            ▼                                                            │
//! │   ┌─── state lock (single writer) ──────────────────────────────────┐  │
//! │   │  zones empty? ──► precision VeryLow, nothing else               │  │
//! │   │  policy = online ? confirmation.online : confirmation.offline   │  │
//! │   │  PresenceState::step on a copy                                  │  │
//! │   │  membership.save_changes(changed)  ──► adopt the copy           │  │
//! │   │  entry confirmed? ──► re-arm shutdown processing                │  │
//! │   │  PrecisionController::update, take the emit lock                │  │
//! │   └─────────────────────────────────────────────────────────────────┘  │
//! │   ┌─── emit lock (keeps events in fix order) ───────────────────────┐  │
//! │   │  LocationProvider::apply_profile                                │  │
//! │   │  EventEmitter::emit for every transition, in order              │  │
//! │   └─────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  Fixes, sweeps, counter resets and shutdown handling all take the state │
//! │  lock, so membership never sees two writers. Remote I/O runs after it   │
//! │  is released, so a shutdown never waits on the network.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session
//! ```text
//! start()
//!   ├── resume_session(now): zone cache → missed-shutdown recovery → arm
//!   ├── spawn: remote zone fetch (backoff), ZoneWorker, SyncWorker,
//!   │          HeartbeatMonitor, stale sweeper, signal router
//!   └── TrackerHandle::stop() → stop workers → was_running = false
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use waypost_core::confirmation::{PolicySet, PresenceState};
use waypost_core::event::{Actor, EventKind, PresenceEvent, ProviderStatusEvent};
use waypost_core::geo::Fix;
use waypost_core::lifecycle::{BatteryGuard, ShutdownCause};
use waypost_core::precision::{PrecisionController, SamplingProfile};
use waypost_core::zone::Zone;
use waypost_db::Database;

use crate::config::TrackerConfig;
use crate::connectivity::Connectivity;
use crate::emitter::{EmitOutcome, EventEmitter};
use crate::error::{SyncError, SyncResult};
use crate::heartbeat::{HeartbeatHandle, HeartbeatMonitor};
use crate::location::LocationProvider;
use crate::registry::{ZoneRegistryService, ZoneWorker, ZoneWorkerHandle};
use crate::remote::{RemoteStore, TimeoutRemoteStore};
use crate::shutdown::{ShutdownHandler, ShutdownReport, ShutdownTrigger};
use crate::signals::{spawn_router, DeviceSignal, SIGNAL_BUFFER};
use crate::sync_engine::{DrainOutcome, SyncEngine, SyncWorker, SyncWorkerHandle};

// =============================================================================
// Observer Trait
// =============================================================================

/// Hook for the host application (notifications, UI badges).
pub trait PresenceObserver: Send + Sync {
    /// An event was produced and delivered or queued.
    fn on_event(&self, event: &PresenceEvent, outcome: EmitOutcome);

    /// The location provider was asked for a new sampling profile.
    fn on_profile(&self, profile: &SamplingProfile);
}

/// No-op observer for headless use and testing.
pub struct NoOpObserver;

impl PresenceObserver for NoOpObserver {
    fn on_event(&self, _event: &PresenceEvent, _outcome: EmitOutcome) {}
    fn on_profile(&self, _profile: &SamplingProfile) {}
}

// =============================================================================
// State
// =============================================================================

/// Mutable tracker state. Only touched under the tracker lock.
pub(crate) struct TrackerState {
    pub(crate) presence: PresenceState,
    pub(crate) precision: PrecisionController,
    pub(crate) battery: BatteryGuard,
}

/// An event produced by the tracker and where it went.
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub event: PresenceEvent,
    pub outcome: EmitOutcome,
}

// =============================================================================
// Tracker
// =============================================================================

struct Inner {
    config: TrackerConfig,
    db: Arc<Database>,
    location: Arc<dyn LocationProvider>,
    observer: Arc<dyn PresenceObserver>,
    connectivity: Connectivity,
    zones: Arc<ZoneRegistryService>,
    engine: Arc<SyncEngine>,
    emitter: EventEmitter,
    shutdown: Arc<ShutdownHandler>,
    heartbeat: HeartbeatMonitor,
    state: Arc<Mutex<TrackerState>>,
    emit_order: Mutex<()>,
    actor: Actor,
    policies: PolicySet,
}

/// Cloneable handle to one tracking session.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<Inner>,
}

impl PresenceTracker {
    /// Builds the tracker over an open database. Restores persisted
    /// membership; nothing is spawned until [`start`](Self::start).
    pub async fn open(
        config: TrackerConfig,
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        location: Arc<dyn LocationProvider>,
    ) -> SyncResult<Self> {
        Self::with_observer(config, db, remote, location, Arc::new(NoOpObserver)).await
    }

    pub async fn with_observer(
        config: TrackerConfig,
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        location: Arc<dyn LocationProvider>,
        observer: Arc<dyn PresenceObserver>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let actor = config.actor.actor();
        if !actor.is_known() {
            warn!("No actor id configured, events will be recorded as {}", actor.id);
        }
        if config.actor.tenant().is_none() {
            warn!("No tenant configured, events stay in the offline queue");
        }

        let presence = db.membership().load_state().await?;
        info!(inside = ?presence.inside_zones(), "Membership restored");

        let state = Arc::new(Mutex::new(TrackerState {
            presence,
            precision: config.precision.controller(),
            battery: config.battery.guard(),
        }));

        let remote: Arc<dyn RemoteStore> =
            Arc::new(TimeoutRemoteStore::new(remote, config.request_timeout()));
        let connectivity = Connectivity::default();
        let zones = Arc::new(ZoneRegistryService::new(&config, db.clone(), remote.clone()));
        let engine = Arc::new(SyncEngine::new(
            &config,
            db.clone(),
            remote.clone(),
            connectivity.clone(),
        ));
        let emitter = EventEmitter::new(
            &config,
            db.clone(),
            remote,
            engine.clone(),
            connectivity.clone(),
        );
        let shutdown = Arc::new(ShutdownHandler::new(
            db.clone(),
            zones.clone(),
            engine.clone(),
            state.clone(),
            actor.clone(),
        ));
        let heartbeat = HeartbeatMonitor::new(&config, db.clone(), shutdown.clone());

        Ok(PresenceTracker {
            inner: Arc::new(Inner {
                policies: config.confirmation.policies(),
                config,
                db,
                location,
                observer,
                connectivity,
                zones,
                engine,
                emitter,
                shutdown,
                heartbeat,
                state,
                emit_order: Mutex::new(()),
                actor,
            }),
        })
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Activates cached zones, settles a missed shutdown from the previous
    /// session, and arms this one.
    pub async fn resume_session(&self, now: DateTime<Utc>) -> SyncResult<Option<ShutdownReport>> {
        self.inner.zones.load_cache().await?;
        self.inner.heartbeat.recover_and_arm(now).await
    }

    /// Resumes the session and spawns every background task.
    pub async fn start(&self) -> SyncResult<TrackerHandle> {
        let inner = &self.inner;
        if let Some(report) = self.resume_session(Utc::now()).await? {
            info!(exits = report.events.len(), "Recovered from missed shutdown");
        }

        let mut tasks = Vec::new();
        let mut startup_fetch = None;

        let zones = inner.zones.clone();
        let subscription = if inner.config.actor.tenant().is_some() {
            startup_fetch = Some(tokio::spawn(async move {
                if let Err(e) = zones.refresh_with_backoff().await {
                    warn!(error = %e, "Startup zone fetch failed, using cached zones");
                }
            }));
            match inner.zones.subscribe().await {
                Ok(rx) => Some(rx),
                Err(e) => {
                    warn!(error = %e, "Zone subscription unavailable");
                    None
                }
            }
        } else {
            None
        };

        let (zone_worker, zone_handle) = ZoneWorker::new(&inner.config, inner.zones.clone(), subscription);
        tasks.push(tokio::spawn(zone_worker.run()));

        let (sync_worker, sync_handle) = SyncWorker::new(&inner.config, inner.engine.clone());
        tasks.push(tokio::spawn(sync_worker.run()));

        let heartbeat = inner.heartbeat.spawn();

        let (sweep_tx, sweep_rx) = mpsc::channel(1);
        tasks.push(self.spawn_sweeper(sweep_rx));

        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (router_tx, router_rx) = mpsc::channel(1);
        tasks.push(spawn_router(self.clone(), signal_rx, router_rx));

        info!(actor = %inner.actor.id, "Presence tracker started");

        Ok(TrackerHandle {
            tracker: self.clone(),
            signals: signal_tx,
            sync: sync_handle,
            zones: zone_handle,
            heartbeat: Some(heartbeat),
            stop_txs: vec![sweep_tx, router_tx],
            startup_fetch,
            tasks,
        })
    }

    fn spawn_sweeper(&self, mut shutdown_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let tracker = self.clone();
        let period = Duration::from_secs(self.inner.config.sweep.interval_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = tracker.sweep_stale(Utc::now()).await {
                            error!(?e, "Stale sweep failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    // =========================================================================
    // Fixes
    // =========================================================================

    /// Runs one fix through evaluation, confirmation, persistence,
    /// precision control and emission.
    pub async fn on_fix(&self, fix: Fix) -> SyncResult<Vec<Emitted>> {
        if let Err(e) = fix.validate() {
            warn!(error = %e, "Ignoring invalid fix");
            return Ok(Vec::new());
        }

        let inner = &self.inner;
        let zones = inner.zones.zones().await;
        let mut state = inner.state.lock().await;

        if zones.is_empty() {
            debug!("No active zones, skipping evaluation");
            let profile = state.precision.update(&fix, &zones);
            drop(state);
            self.apply_profile(profile).await;
            return Ok(Vec::new());
        }

        let policy = inner.policies.select(inner.connectivity.is_online());
        let mut presence = state.presence.clone();
        let outcome = presence.step(&fix, &zones, policy);

        if !outcome.changed.is_empty() {
            inner.db.membership().save_changes(&presence, &outcome.changed).await?;
        }
        state.presence = presence;

        if outcome.transitions.iter().any(|t| t.kind == EventKind::Entry) {
            // Armed while any zone is inside
            if let Err(e) = inner.db.lifecycle().rearm_shutdown().await {
                warn!(error = %e, "Failed to re-arm shutdown handling");
            }
        }

        let profile = state.precision.update(&fix, &zones);
        let _emitting = inner.emit_order.lock().await;
        drop(state);

        self.apply_profile(profile).await;

        let mut emitted = Vec::with_capacity(outcome.transitions.len());
        for transition in &outcome.transitions {
            let zone = zones.iter().find(|z| z.code == transition.zone_code);
            let event = PresenceEvent::from_transition(transition, zone, &inner.actor, fix.accuracy_m);
            info!(zone = %event.zone_code, kind = %event.kind, reason = ?transition.reason, "Transition confirmed");

            match inner.emitter.emit(&event).await {
                Ok(outcome) => {
                    inner.observer.on_event(&event, outcome);
                    emitted.push(Emitted { event, outcome });
                }
                Err(e) => error!(?e, local_id = %event.local_id, "Failed to emit event"),
            }
        }

        Ok(emitted)
    }

    async fn apply_profile(&self, profile: Option<SamplingProfile>) {
        let Some(profile) = profile else {
            return;
        };
        info!(level = ?profile.level, "Sampling profile changed");
        if let Err(e) = self.inner.location.apply_profile(profile).await {
            warn!(error = %e, "Location provider rejected profile");
        }
        self.inner.observer.on_profile(&profile);
    }

    /// Synthesizes automatic exits for zones inside longer than the stale
    /// threshold. They are queued before any upload attempt.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> SyncResult<Vec<PresenceEvent>> {
        let inner = &self.inner;
        let zones = inner.zones.zones().await;
        let mut state = inner.state.lock().await;

        let mut presence = state.presence.clone();
        let outcome = presence.sweep_stale(now, inner.config.stale_after(), &zones);
        if outcome.is_empty() {
            return Ok(Vec::new());
        }

        inner.db.membership().save_changes(&presence, &outcome.changed).await?;
        state.presence = presence;
        let _emitting = inner.emit_order.lock().await;
        drop(state);

        let mut events = Vec::with_capacity(outcome.transitions.len());
        for transition in &outcome.transitions {
            let zone = zones.iter().find(|z| z.code == transition.zone_code);
            let event = PresenceEvent::from_transition(transition, zone, &inner.actor, 0.0);
            warn!(zone = %event.zone_code, "Stale entry, automatic exit");
            inner.emitter.emit_local_first(&event).await?;
            inner.observer.on_event(&event, EmitOutcome::Queued);
            events.push(event);
        }
        Ok(events)
    }

    /// Drops any half-confirmed crossing for the zone.
    pub async fn clear_counters(&self, zone_code: &str) -> SyncResult<bool> {
        let mut state = self.inner.state.lock().await;
        let mut presence = state.presence.clone();
        if !presence.clear_counters(zone_code) {
            return Ok(false);
        }
        let changed: BTreeSet<String> = std::iter::once(zone_code.to_string()).collect();
        self.inner.db.membership().save_changes(&presence, &changed).await?;
        state.presence = presence;
        Ok(true)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn membership(&self) -> PresenceState {
        self.inner.state.lock().await.presence.clone()
    }

    pub async fn inside_zones(&self) -> Vec<String> {
        self.inner.state.lock().await.presence.inside_zones()
    }

    pub async fn find_zone_by_name(&self, name: &str) -> Option<Zone> {
        self.inner.zones.find_by_name(name).await
    }

    pub fn zones(&self) -> &ZoneRegistryService {
        &self.inner.zones
    }

    pub fn actor(&self) -> &Actor {
        &self.inner.actor
    }

    // =========================================================================
    // Connectivity & Sync
    // =========================================================================

    pub fn is_network_available(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Records connectivity. Restoring it drains the offline queue.
    pub async fn set_network_available(&self, online: bool) -> SyncResult<Option<DrainOutcome>> {
        if !self.inner.connectivity.set(online) {
            return Ok(None);
        }
        info!("Connectivity restored, draining offline queue");
        self.inner.engine.drain().await.map(Some)
    }

    /// Records connectivity without waiting for the drain a restored
    /// connection starts.
    pub fn note_network_available(&self, online: bool) {
        if !self.inner.connectivity.set(online) {
            return;
        }
        info!("Connectivity restored, draining offline queue in the background");
        let engine = self.inner.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.drain().await {
                error!(?e, "Background drain failed");
            }
        });
    }

    pub async fn sync_now(&self) -> SyncResult<DrainOutcome> {
        self.inner.engine.drain().await
    }

    // =========================================================================
    // Device Signals
    // =========================================================================

    pub async fn on_powering_down(
        &self,
        cause: ShutdownCause,
        now: DateTime<Utc>,
    ) -> SyncResult<ShutdownReport> {
        self.inner
            .shutdown
            .handle(ShutdownTrigger::PoweringDown(cause), now)
            .await
    }

    /// Feeds a battery reading. Forces exits once per discharge at the
    /// critical level; recovering past the reset level re-arms shutdown
    /// processing.
    pub async fn on_battery_level(&self, level: u8, now: DateTime<Utc>) -> SyncResult<Option<ShutdownReport>> {
        let (tripped, recovered) = {
            let mut state = self.inner.state.lock().await;
            let was_tripped = state.battery.is_tripped();
            let tripped = state.battery.observe(level);
            (tripped, was_tripped && !state.battery.is_tripped())
        };

        if recovered {
            info!(level, "Battery recovered, re-arming shutdown handling");
            self.inner.db.lifecycle().rearm_shutdown().await?;
        }
        if !tripped {
            return Ok(None);
        }

        warn!(level, "Battery critical, forcing exits");
        self.inner
            .shutdown
            .handle(ShutdownTrigger::BatteryCritical { level }, now)
            .await
            .map(Some)
    }

    pub async fn on_provider_status(&self, enabled: bool, now: DateTime<Utc>) -> SyncResult<EmitOutcome> {
        let event = ProviderStatusEvent::new(enabled, &self.inner.actor, now);
        info!(kind = event.kind(), "Location provider status changed");
        if enabled {
            // Fresh subscription: let the next fix pick the profile
            self.inner.state.lock().await.precision.reset();
        }
        self.inner.emitter.emit_provider_status(&event).await
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Running session. Dropping it leaves the tasks running; call
/// [`stop`](Self::stop) for a clean teardown.
pub struct TrackerHandle {
    tracker: PresenceTracker,
    signals: mpsc::Sender<DeviceSignal>,
    sync: SyncWorkerHandle,
    zones: ZoneWorkerHandle,
    heartbeat: Option<HeartbeatHandle>,
    stop_txs: Vec<mpsc::Sender<()>>,
    startup_fetch: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TrackerHandle {
    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    /// Sender for platform notifications.
    pub fn signals(&self) -> mpsc::Sender<DeviceSignal> {
        self.signals.clone()
    }

    /// Requests a drain from the sync worker.
    pub fn trigger_sync(&self) {
        self.sync.trigger();
    }

    /// Stops every task and records a clean stop.
    pub async fn stop(mut self) -> SyncResult<()> {
        info!("Stopping presence tracker");

        if let Some(fetch) = self.startup_fetch.take() {
            fetch.abort();
        }

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await?;
        }
        for tx in &self.stop_txs {
            let _ = tx.send(()).await;
        }
        let _ = self.sync.shutdown().await;
        let _ = self.zones.shutdown().await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(?e, "Tracker task ended abnormally");
            }
        }

        self.tracker
            .inner
            .db
            .lifecycle()
            .mark_stopped(Utc::now())
            .await
            .map_err(SyncError::from)?;
        info!("Presence tracker stopped");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
