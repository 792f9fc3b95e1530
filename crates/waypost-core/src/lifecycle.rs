//! # Device Lifecycle Rules
//!
//! Heartbeat and shutdown bookkeeping, and the rule that infers a shutdown
//! nobody observed.
//!
//! ## Missed Shutdown Inference
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  session N running          power lost            session N+1 starts    │
//! │  ──────────────────         ──────────            ───────────────────   │
//! │  beat ─ beat ─ beat ─ beat ─ ✗                    read HeartbeatRecord  │
//! │                          ▲                                │             │
//! │                          │ last_beat_at                   ▼             │
//! │                          │                  was_running && !processed   │
//! │                          │                  && now - last_beat > gap ?  │
//! │                          │                                │ yes         │
//! │                          └──── estimated shutdown instant ◄┘            │
//! │                                                                         │
//! │  A clean stop clears was_running; an observed shutdown sets processed.  │
//! │  Either one suppresses recovery at the next start.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// =============================================================================
// Shutdown Cause
// =============================================================================

/// Why exits were forced for every inside zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownCause {
    /// User powered the device off.
    User,
    /// Battery reached the critical threshold.
    Battery,
    /// Device is rebooting.
    Reboot,
    /// Emergency/thermal shutdown.
    Emergency,
    /// Inferred at startup from a stale heartbeat.
    Recovery,
}

impl ShutdownCause {
    /// Human-readable reason stored with the shutdown state and events.
    pub fn reason(&self) -> &'static str {
        match self {
            ShutdownCause::User => "Device powered off",
            ShutdownCause::Battery => "Battery critically low",
            ShutdownCause::Reboot => "Device rebooting",
            ShutdownCause::Emergency => "Emergency shutdown",
            ShutdownCause::Recovery => "Shutdown not detected (recovery)",
        }
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::User => write!(f, "user"),
            ShutdownCause::Battery => write!(f, "battery"),
            ShutdownCause::Reboot => write!(f, "reboot"),
            ShutdownCause::Emergency => write!(f, "emergency"),
            ShutdownCause::Recovery => write!(f, "recovery"),
        }
    }
}

impl FromStr for ShutdownCause {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" | "power_off" => Ok(ShutdownCause::User),
            "battery" => Ok(ShutdownCause::Battery),
            "reboot" => Ok(ShutdownCause::Reboot),
            "emergency" | "thermal" => Ok(ShutdownCause::Emergency),
            "recovery" => Ok(ShutdownCause::Recovery),
            other => Err(ValidationError::InvalidFormat {
                field: "shutdown_cause".to_string(),
                reason: format!("unknown cause '{other}'"),
            }),
        }
    }
}

// =============================================================================
// Detection Method
// =============================================================================

/// How the shutdown was noticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// A power-down/reboot signal was delivered while running.
    RealtimeShutdown,
    /// Battery level crossed the critical threshold.
    BatteryCritical,
    /// Next start found the previous session's heartbeat stale.
    BootHeartbeatGap,
    /// The running monitor found its own heartbeat stale.
    HeartbeatGap,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectionMethod::RealtimeShutdown => "realtime_shutdown",
            DetectionMethod::BatteryCritical => "battery_critical",
            DetectionMethod::BootHeartbeatGap => "boot_heartbeat_gap",
            DetectionMethod::HeartbeatGap => "heartbeat_gap",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Persisted Records
// =============================================================================

/// Liveness stamp written by the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatRecord {
    pub last_beat_at: Option<DateTime<Utc>>,
    pub was_running: bool,
    pub last_boot_at: Option<DateTime<Utc>>,
}

/// Outcome of the most recent shutdown processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownState {
    pub last_reason: Option<String>,
    pub last_at: Option<DateTime<Utc>>,

    /// True once exits for the current session have been forced. Armed
    /// (false) at session start.
    pub processed: bool,

    /// True when the last processing was a recovery after a missed shutdown.
    pub recovery: bool,
}

impl Default for ShutdownState {
    /// Fresh installs start processed so that a first boot never triggers
    /// recovery.
    fn default() -> Self {
        ShutdownState {
            last_reason: None,
            last_at: None,
            processed: true,
            recovery: false,
        }
    }
}

/// Returns the estimated shutdown instant when the previous session ended
/// without a processed shutdown and its last heartbeat is older than `gap`.
pub fn detect_missed_shutdown(
    heartbeat: &HeartbeatRecord,
    shutdown: &ShutdownState,
    now: DateTime<Utc>,
    gap: Duration,
) -> Option<DateTime<Utc>> {
    if !heartbeat.was_running || shutdown.processed {
        return None;
    }
    let last_beat = heartbeat.last_beat_at?;
    (now - last_beat > gap).then_some(last_beat)
}

// =============================================================================
// Battery Guard
// =============================================================================

/// Decides when a battery reading should force exits.
///
/// Fires once when the level drops to `critical_percent` or below, then stays
/// quiet until the level recovers above `reset_percent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryGuard {
    pub critical_percent: u8,
    pub reset_percent: u8,
    tripped: bool,
}

impl BatteryGuard {
    pub fn new(critical_percent: u8, reset_percent: u8) -> Self {
        BatteryGuard {
            critical_percent,
            reset_percent,
            tripped: false,
        }
    }

    /// Feeds one reading. Returns true when exits must be forced now.
    pub fn observe(&mut self, level_percent: u8) -> bool {
        if level_percent > self.reset_percent {
            self.tripped = false;
            return false;
        }
        if level_percent <= self.critical_percent && !self.tripped {
            self.tripped = true;
            return true;
        }
        false
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }
}

impl Default for BatteryGuard {
    fn default() -> Self {
        BatteryGuard::new(3, 15)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
