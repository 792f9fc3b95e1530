//! Device signals delivered by the platform layer.
//!
//! Power, battery, provider and connectivity notifications arrive on one
//! channel and are applied to the tracker in arrival order.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use waypost_core::lifecycle::ShutdownCause;

use crate::error::SyncResult;
use crate::tracker::PresenceTracker;

/// Capacity of the signal channel.
pub const SIGNAL_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSignal {
    PoweringDown(ShutdownCause),
    Battery { level: u8 },
    ProviderStatus { enabled: bool },
    Connectivity { online: bool },
}

impl PresenceTracker {
    /// Applies one signal. Timestamps are taken on arrival.
    pub async fn on_signal(&self, signal: DeviceSignal) -> SyncResult<()> {
        let now = Utc::now();
        debug!(?signal, "Device signal");
        match signal {
            DeviceSignal::PoweringDown(cause) => {
                self.on_powering_down(cause, now).await?;
            }
            DeviceSignal::Battery { level } => {
                self.on_battery_level(level, now).await?;
            }
            DeviceSignal::ProviderStatus { enabled } => {
                self.on_provider_status(enabled, now).await?;
            }
            DeviceSignal::Connectivity { online } => {
                // Drains detached so later signals are not queued behind it
                self.note_network_available(online);
            }
        }
        Ok(())
    }
}

/// Consumes signals until every sender is gone or `shutdown_rx` fires.
pub(crate) fn spawn_router(
    tracker: PresenceTracker,
    mut signals: mpsc::Receiver<DeviceSignal>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(signal) => {
                        if let Err(e) = tracker.on_signal(signal).await {
                            error!(?e, ?signal, "Failed to apply device signal");
                        }
                    }
                    None => break,
                },

                _ = shutdown_rx.recv() => break,
            }
        }
        info!("Signal router stopped");
    })
}
