//! # waypost-sync: Presence Tracking Runtime
//!
//! Everything with a clock, a socket or a timer lives here. The pure rules
//! come from `waypost-core`; durability comes from `waypost-db`.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tracker Runtime                                  │
//! │                                                                         │
//! │  LocationProvider ──Fix──►┌──────────────────────────┐                  │
//! │        ▲                  │     PresenceTracker      │◄── DeviceSignal  │
//! │        │ SamplingProfile  │  (single-writer state)   │    power/battery │
//! │        └──────────────────┤                          │    provider/net  │
//! │                           └──┬──────────┬─────────┬──┘                  │
//! │                              │          │         │                     │
//! │         ┌────────────────────▼┐  ┌──────▼──────┐ ┌▼──────────────────┐  │
//! │         │ ZoneRegistryService │  │EventEmitter │ │ ShutdownHandler   │  │
//! │         │ cache + remote +    │  │online-first │ │ local-first exits │  │
//! │         │ subscription        │  │+ fallback   │ │ once per session  │  │
//! │         └─────────────────────┘  └──────┬──────┘ └─────────▲─────────┘  │
//! │                                         │                  │            │
//! │                                  ┌──────▼──────┐  ┌────────┴─────────┐  │
//! │                                  │ SyncEngine  │  │ HeartbeatMonitor │  │
//! │                                  │ sequential  │  │ 30 s beat,       │  │
//! │                                  │ drain       │  │ gap detection    │  │
//! │                                  └──────┬──────┘  └──────────────────┘  │
//! │                                         ▼                               │
//! │                                   RemoteStore                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`tracker`] - `PresenceTracker` orchestrator and its session handle
//! - [`config`] - `TrackerConfig` (TOML file + `WAYPOST_*` environment)
//! - [`remote`] - `RemoteStore` trait and the in-memory store
//! - [`location`] - `LocationProvider` trait
//! - [`emitter`] - Online-first event delivery
//! - [`sync_engine`] - Offline queue drain and cleanup worker
//! - [`registry`] - Zone set maintenance
//! - [`heartbeat`] - Liveness stamps and missed-shutdown detection
//! - [`shutdown`] - Forced exits on power loss
//! - [`signals`] - Platform signal routing
//! - [`connectivity`] - Shared online flag
//! - [`error`] - Runtime error types
//!
//! ## Usage
//! ```rust,ignore
//! let config = TrackerConfig::load(None)?;
//! let db = Arc::new(Database::new(DbConfig::new(config.database_path())).await?);
//! let tracker = PresenceTracker::open(config, db, remote, location).await?;
//! let handle = tracker.start().await?;
//!
//! handle.signals().send(DeviceSignal::Connectivity { online: true }).await?;
//! tracker.on_fix(fix).await?;
//!
//! handle.stop().await?;
//! ```

pub mod config;
pub mod connectivity;
pub mod emitter;
pub mod error;
pub mod heartbeat;
pub mod location;
pub mod registry;
pub mod remote;
pub mod shutdown;
pub mod signals;
pub mod sync_engine;
pub mod tracker;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::TrackerConfig;
pub use connectivity::Connectivity;
pub use emitter::{EmitOutcome, EventEmitter};
pub use error::{SyncError, SyncResult};
pub use heartbeat::{HeartbeatHandle, HeartbeatMonitor};
pub use location::{LocationProvider, RecordingLocationProvider};
pub use registry::{SnapshotOutcome, ZoneRegistryService, ZoneWorker, ZoneWorkerHandle};
pub use remote::{InMemoryRemoteStore, RemoteStore, StoredEvent, TimeoutRemoteStore};
pub use shutdown::{ShutdownHandler, ShutdownReport, ShutdownTrigger};
pub use signals::DeviceSignal;
pub use sync_engine::{DrainOutcome, DrainReport, SyncEngine, SyncWorker, SyncWorkerHandle};
pub use tracker::{Emitted, NoOpObserver, PresenceObserver, PresenceTracker, TrackerHandle};

// =============================================================================
// Shared Test Fixtures
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};
    use serde_json::{json, Value};

    use waypost_core::confirmation::{Transition, TransitionReason};
    use waypost_core::event::{Actor, EventKind, PresenceEvent};
    use waypost_core::geo::Position;
    use waypost_db::{Database, DbConfig};

    use crate::config::TrackerConfig;

    pub fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    pub async fn memory_db() -> Arc<Database> {
        Arc::new(Database::new(DbConfig::in_memory()).await.unwrap())
    }

    pub fn config_with_tenant(tenant: Option<&str>) -> TrackerConfig {
        let mut config = TrackerConfig::default();
        config.actor.id = "u-1".into();
        config.actor.name = "Ana".into();
        config.actor.tenant_id = tenant.map(str::to_string);
        config
    }

    /// Event for actor `u-1`, `secs` after [`t0`].
    pub fn presence_event(kind: EventKind, zone: &str, secs: i64) -> PresenceEvent {
        let transition = Transition {
            kind,
            zone_code: zone.to_string(),
            position: Position::new(-23.55, -46.63),
            at: t0() + Duration::seconds(secs),
            reason: TransitionReason::Confirmed,
        };
        PresenceEvent::from_transition(&transition, None, &Actor::new("u-1", "Ana"), 5.0)
    }

    /// Remote zone document named `Zone <code>`.
    pub fn zone_doc(code: &str, latitude: f64, longitude: f64, radius: f64) -> Value {
        json!({
            "code": code,
            "name": format!("Zone {code}"),
            "latitude": latitude,
            "longitude": longitude,
            "radius": radius,
        })
    }
}
