//! # Heartbeat Monitor
//!
//! Stamps liveness every 30 s so the next session can tell a clean stop from
//! a lost one, and watches its own stamp for gaps while running.
//!
//! ## Checks
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  session start (recover_and_arm)                                        │
//! │     previous record: was_running && !processed && beat older than 5 min│
//! │        → ShutdownHandler(Recovery { last beat, boot_heartbeat_gap })   │
//! │     then arm: was_running=1, processed=0, beat=boot=now                 │
//! │                                                                         │
//! │  running                                                                │
//! │     every 30 s  check gap (90 s), then beat(now)                        │
//! │     every 60 s  check gap (90 s)                                        │
//! │        gap → ShutdownHandler(Recovery { last beat, heartbeat_gap })     │
//! │              then re-arm and beat: the session is still alive           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use waypost_core::lifecycle::{detect_missed_shutdown, DetectionMethod};
use waypost_db::Database;

use crate::config::TrackerConfig;
use crate::error::{SyncError, SyncResult};
use crate::shutdown::{ShutdownHandler, ShutdownReport, ShutdownTrigger};

#[derive(Clone)]
pub struct HeartbeatMonitor {
    db: Arc<Database>,
    handler: Arc<ShutdownHandler>,
    beat_interval: Duration,
    check_interval: Duration,
    in_process_gap: ChronoDuration,
    boot_gap: ChronoDuration,
}

impl HeartbeatMonitor {
    pub fn new(config: &TrackerConfig, db: Arc<Database>, handler: Arc<ShutdownHandler>) -> Self {
        HeartbeatMonitor {
            db,
            handler,
            beat_interval: Duration::from_secs(config.heartbeat.interval_secs),
            check_interval: Duration::from_secs(config.heartbeat.check_interval_secs),
            in_process_gap: config.in_process_gap(),
            boot_gap: config.boot_gap(),
        }
    }

    /// Settles the previous session, then arms this one.
    pub async fn recover_and_arm(&self, now: DateTime<Utc>) -> SyncResult<Option<ShutdownReport>> {
        let lifecycle = self.db.lifecycle();
        let record = lifecycle.heartbeat().await?;
        let state = lifecycle.shutdown_state().await?;

        let report = match detect_missed_shutdown(&record, &state, now, self.boot_gap) {
            Some(estimated_at) => {
                warn!(%estimated_at, "Previous session ended without a processed shutdown");
                let trigger = ShutdownTrigger::Recovery {
                    estimated_at,
                    detection: DetectionMethod::BootHeartbeatGap,
                };
                Some(self.handler.handle(trigger, now).await?)
            }
            None => None,
        };

        lifecycle.arm_session(now).await?;
        info!(boot_at = %now, "Session armed");
        Ok(report)
    }

    /// In-process gap check. A detected gap is handled as a recovery, then
    /// the session is re-armed with a fresh beat.
    pub async fn check_gap(&self, now: DateTime<Utc>) -> SyncResult<Option<ShutdownReport>> {
        let lifecycle = self.db.lifecycle();
        let record = lifecycle.heartbeat().await?;
        let state = lifecycle.shutdown_state().await?;

        let Some(estimated_at) = detect_missed_shutdown(&record, &state, now, self.in_process_gap) else {
            return Ok(None);
        };

        warn!(%estimated_at, gap_secs = (now - estimated_at).num_seconds(), "Heartbeat gap detected");
        let trigger = ShutdownTrigger::Recovery {
            estimated_at,
            detection: DetectionMethod::HeartbeatGap,
        };
        let report = self.handler.handle(trigger, now).await?;
        lifecycle.rearm_shutdown().await?;
        lifecycle.beat(now).await?;
        Ok(Some(report))
    }

    /// Gap check followed by a fresh stamp.
    pub async fn beat(&self, now: DateTime<Utc>) -> SyncResult<Option<ShutdownReport>> {
        let report = self.check_gap(now).await?;
        self.db.lifecycle().beat(now).await?;
        debug!(at = %now, "Heartbeat");
        Ok(report)
    }

    /// Runs the beat and check timers until the handle stops them.
    pub fn spawn(&self) -> HeartbeatHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let monitor = self.clone();

        let task = tokio::spawn(async move {
            info!(interval = ?monitor.beat_interval, "Heartbeat monitor starting");

            let mut beat = tokio::time::interval(monitor.beat_interval);
            beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut check = tokio::time::interval(monitor.check_interval);
            check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = beat.tick() => {
                        if let Err(e) = monitor.beat(Utc::now()).await {
                            error!(?e, "Heartbeat failed");
                        }
                    }

                    _ = check.tick() => {
                        if let Err(e) = monitor.check_gap(Utc::now()).await {
                            error!(?e, "Heartbeat gap check failed");
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        info!("Heartbeat monitor shutting down");
                        break;
                    }
                }
            }
        });

        HeartbeatHandle { shutdown_tx, task }
    }
}

pub struct HeartbeatHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn stop(self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|e| SyncError::ChannelError(e.to_string()))?;
        self.task
            .await
            .map_err(|e| SyncError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::Connectivity;
    use crate::registry::ZoneRegistryService;
    use crate::remote::InMemoryRemoteStore;
    use crate::sync_engine::SyncEngine;
    use crate::testing::{config_with_tenant, memory_db, t0, zone_doc};
    use crate::tracker::TrackerState;
    use tokio::sync::Mutex;
    use waypost_core::confirmation::PresenceState;
    use waypost_core::event::EventKind;
    use waypost_core::geo::Fix;

    async fn monitor() -> (HeartbeatMonitor, Arc<Database>, Arc<Mutex<TrackerState>>) {
        let config = config_with_tenant(None);
        let db = memory_db().await;
        let remote = Arc::new(InMemoryRemoteStore::new());
        let zones = Arc::new(ZoneRegistryService::new(&config, db.clone(), remote.clone()));
        zones
            .apply_snapshot(&[zone_doc("A", 10.0, 10.0, 100.0)])
            .await
            .unwrap();

        // Actor confirmed inside A
        let zone_list = zones.zones().await;
        let mut presence = PresenceState::default();
        for minute in 0..3 {
            let fix = Fix::new(zone_list[0].center(), 5.0, t0() + ChronoDuration::minutes(minute));
            presence.step(&fix, &zone_list, &Default::default());
        }
        assert!(presence.is_inside("A"));

        let state = Arc::new(Mutex::new(TrackerState {
            presence,
            precision: Default::default(),
            battery: Default::default(),
        }));
        let engine = Arc::new(SyncEngine::new(&config, db.clone(), remote, Connectivity::default()));
        let handler = Arc::new(ShutdownHandler::new(
            db.clone(),
            zones,
            engine,
            state.clone(),
            config.actor.actor(),
        ));
        (HeartbeatMonitor::new(&config, db.clone(), handler), db, state)
    }

    #[tokio::test]
    async fn test_fresh_install_arms_without_recovery() {
        let (monitor, db, _state) = monitor().await;
        assert!(monitor.recover_and_arm(t0()).await.unwrap().is_none());

        let record = db.lifecycle().heartbeat().await.unwrap();
        assert!(record.was_running);
        assert_eq!(record.last_boot_at, Some(t0()));
        assert!(!db.lifecycle().shutdown_state().await.unwrap().processed);
    }

    #[tokio::test]
    async fn test_in_process_gap_forces_exit_and_rearms() {
        let (monitor, db, state) = monitor().await;
        monitor.recover_and_arm(t0()).await.unwrap();

        assert!(monitor.beat(t0() + ChronoDuration::seconds(30)).await.unwrap().is_none());
        assert!(monitor.check_gap(t0() + ChronoDuration::seconds(100)).await.unwrap().is_none());

        // Suspended for ten minutes
        let woke = t0() + ChronoDuration::minutes(10) + ChronoDuration::seconds(30);
        let report = monitor.check_gap(woke).await.unwrap().unwrap();
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].kind, EventKind::ShutdownExit);
        assert_eq!(report.events[0].occurred_at, t0() + ChronoDuration::seconds(30));
        assert_eq!(
            report.events[0].detection_method,
            Some(DetectionMethod::HeartbeatGap)
        );
        assert!(state.lock().await.presence.inside_zones().is_empty());

        // Re-armed with a fresh beat: no second detection, later shutdowns still handled
        assert!(monitor.check_gap(woke).await.unwrap().is_none());
        let shutdown = db.lifecycle().shutdown_state().await.unwrap();
        assert!(!shutdown.processed);
        assert!(shutdown.recovery);
    }
}
