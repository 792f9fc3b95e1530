//! # Shutdown Handler
//!
//! Forces an exit for every zone the actor is inside when the device goes
//! away: power-down, critical battery, or a shutdown discovered afterwards.
//!
//! ## Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  handle(trigger)                                                        │
//! │    1. lock tracker state (no fix is processed meanwhile)                │
//! │    2. force_exit_all on a copy of the presence state                    │
//! │    3. build ShutdownExit events: accuracy 1.0, cause, detection method │
//! │    4. ONE transaction: processed=1, queue events, clear rows           │
//! │         recovery only: claim processed=0→1, lost → nothing written     │
//! │    5. adopt the new presence state, release the lock                    │
//! │    6. drain the offline queue in the background                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use waypost_core::event::{Actor, PresenceEvent};
use waypost_core::lifecycle::{DetectionMethod, ShutdownCause, ShutdownState};
use waypost_db::Database;

use crate::error::SyncResult;
use crate::registry::ZoneRegistryService;
use crate::sync_engine::SyncEngine;
use crate::tracker::TrackerState;

/// Accuracy recorded on synthesized shutdown exits.
const SHUTDOWN_ACCURACY_M: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// The platform announced a power-down or reboot.
    PoweringDown(ShutdownCause),
    BatteryCritical { level: u8 },
    /// A shutdown nobody observed, dated at the last heartbeat.
    Recovery {
        estimated_at: DateTime<Utc>,
        detection: DetectionMethod,
    },
}

impl ShutdownTrigger {
    fn classify(&self, now: DateTime<Utc>) -> (ShutdownCause, DetectionMethod, DateTime<Utc>) {
        match *self {
            ShutdownTrigger::PoweringDown(cause) => (cause, DetectionMethod::RealtimeShutdown, now),
            ShutdownTrigger::BatteryCritical { .. } => {
                (ShutdownCause::Battery, DetectionMethod::BatteryCritical, now)
            }
            ShutdownTrigger::Recovery {
                estimated_at,
                detection,
            } => (ShutdownCause::Recovery, detection, estimated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownReport {
    /// Forced exits, already in the offline queue when `committed`.
    pub events: Vec<PresenceEvent>,
    /// False when a recovery found this session's shutdown already
    /// processed. Observed shutdowns always commit.
    pub committed: bool,
}

pub struct ShutdownHandler {
    db: Arc<Database>,
    zones: Arc<ZoneRegistryService>,
    engine: Arc<SyncEngine>,
    state: Arc<Mutex<TrackerState>>,
    actor: Actor,
}

impl ShutdownHandler {
    pub(crate) fn new(
        db: Arc<Database>,
        zones: Arc<ZoneRegistryService>,
        engine: Arc<SyncEngine>,
        state: Arc<Mutex<TrackerState>>,
        actor: Actor,
    ) -> Self {
        ShutdownHandler {
            db,
            zones,
            engine,
            state,
            actor,
        }
    }

    pub async fn handle(&self, trigger: ShutdownTrigger, now: DateTime<Utc>) -> SyncResult<ShutdownReport> {
        let (cause, detection, at) = trigger.classify(now);
        let zones = self.zones.zones().await;

        let mut state = self.state.lock().await;
        let mut presence = state.presence.clone();
        let outcome = presence.force_exit_all(at, &zones);

        let events: Vec<PresenceEvent> = outcome
            .transitions
            .iter()
            .map(|t| {
                let zone = zones.iter().find(|z| z.code == t.zone_code);
                PresenceEvent::from_transition(t, zone, &self.actor, SHUTDOWN_ACCURACY_M)
                    .with_shutdown(cause, detection)
            })
            .collect();

        let shutdown = ShutdownState {
            last_reason: Some(cause.reason().to_string()),
            last_at: Some(at),
            processed: true,
            recovery: matches!(trigger, ShutdownTrigger::Recovery { .. }),
        };
        let cleared: Vec<String> = outcome.changed.into_iter().collect();

        let lifecycle = self.db.lifecycle();
        if shutdown.recovery {
            if !lifecycle.claim_recovery(&shutdown, &events, &cleared).await? {
                warn!(%cause, %detection, "Shutdown already processed this session, ignoring");
                return Ok(ShutdownReport {
                    events: Vec::new(),
                    committed: false,
                });
            }
        } else {
            lifecycle.commit_shutdown(&shutdown, &events, &cleared).await?;
        }

        state.presence = presence;
        drop(state);

        info!(
            %cause,
            %detection,
            exits = events.len(),
            at = %at,
            "Forced exits committed"
        );

        if !events.is_empty() {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.drain().await {
                    error!(?e, "Drain after forced exits failed");
                }
            });
        }

        Ok(ShutdownReport {
            events,
            committed: true,
        })
    }
}
