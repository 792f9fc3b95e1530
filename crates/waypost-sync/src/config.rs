//! # Tracker Configuration
//!
//! Configuration management for the presence tracker.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     WAYPOST_ACTOR_ID=emp-042                                           │
//! │     WAYPOST_TENANT_ID=acme                                             │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tracker/waypost.toml (Linux)                             │
//! │     ~/Library/Application Support/com.waypost.tracker/waypost.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     3 fixes / 2 min confirmation, 2 min dedup window, 5 min sync       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # waypost.toml
//! [actor]
//! id = "emp-042"
//! name = "Ana Souza"
//! tenant_id = "acme"
//!
//! [confirmation]
//! online_required_count = 3
//! online_min_interval_secs = 120
//! offline_required_count = 3
//! offline_min_interval_secs = 120
//!
//! [sync]
//! interval_secs = 300
//! retention_days = 7
//! ```

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use waypost_core::confirmation::{ConfirmationPolicy, PolicySet};
use waypost_core::event::{Actor, DedupWindow};
use waypost_core::lifecycle::BatteryGuard;
use waypost_core::precision::PrecisionController;

use crate::error::{SyncError, SyncResult};

/// Upper bound for any duration setting: ten years.
const MAX_SETTING_SECS: u64 = 10 * 365 * 24 * 60 * 60;

const MAX_RETENTION_DAYS: u32 = 10 * 365;

// =============================================================================
// Actor
// =============================================================================

/// Who is being tracked and which tenant their events belong to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Blank ids are recorded as `unknown_actor`.
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Remote partition for events and zones. Without it everything stays in
    /// the local queue.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl ActorConfig {
    pub fn actor(&self) -> Actor {
        Actor::new(self.id.clone(), self.name.clone())
    }

    /// Trimmed tenant id, if any.
    pub fn tenant(&self) -> Option<String> {
        self.tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

// =============================================================================
// Confirmation
// =============================================================================

/// Debounce thresholds, chosen per fix by connectivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationSettings {
    #[serde(default = "default_required_count")]
    pub online_required_count: u32,

    #[serde(default = "default_min_interval")]
    pub online_min_interval_secs: u64,

    #[serde(default = "default_required_count")]
    pub offline_required_count: u32,

    #[serde(default = "default_min_interval")]
    pub offline_min_interval_secs: u64,
}

fn default_required_count() -> u32 {
    3
}
fn default_min_interval() -> u64 {
    120
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        ConfirmationSettings {
            online_required_count: default_required_count(),
            online_min_interval_secs: default_min_interval(),
            offline_required_count: default_required_count(),
            offline_min_interval_secs: default_min_interval(),
        }
    }
}

impl ConfirmationSettings {
    pub fn policies(&self) -> PolicySet {
        PolicySet {
            online: ConfirmationPolicy {
                required_count: self.online_required_count,
                min_interval: secs(self.online_min_interval_secs),
            },
            offline: ConfirmationPolicy {
                required_count: self.offline_required_count,
                min_interval: secs(self.offline_min_interval_secs),
            },
        }
    }
}

// =============================================================================
// Dedup / Sync / Zones / Sweep
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSettings {
    /// Symmetric window for the duplicate rule.
    #[serde(default = "default_dedup_window")]
    pub window_secs: u64,
}

fn default_dedup_window() -> u64 {
    120
}

impl Default for DedupSettings {
    fn default() -> Self {
        DedupSettings {
            window_secs: default_dedup_window(),
        }
    }
}

impl DedupSettings {
    pub fn window(&self) -> DedupWindow {
        DedupWindow::new(secs(self.window_secs))
    }
}

/// Offline queue drain and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Periodic drain interval.
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Entries read per page during a drain.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Queued entries older than this are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Delay before the first cleanup pass.
    #[serde(default = "default_cleanup_delay")]
    pub cleanup_initial_delay_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_sync_interval() -> u64 {
    5 * 60
}
fn default_batch_size() -> u32 {
    50
}
fn default_retention_days() -> u32 {
    7
}
fn default_cleanup_delay() -> u64 {
    60 * 60
}
fn default_cleanup_interval() -> u64 {
    24 * 60 * 60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            interval_secs: default_sync_interval(),
            batch_size: default_batch_size(),
            retention_days: default_retention_days(),
            cleanup_initial_delay_secs: default_cleanup_delay(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneSettings {
    /// Full refresh from the remote store.
    #[serde(default = "default_zone_refresh")]
    pub refresh_interval_secs: u64,
}

fn default_zone_refresh() -> u64 {
    24 * 60 * 60
}

impl Default for ZoneSettings {
    fn default() -> Self {
        ZoneSettings {
            refresh_interval_secs: default_zone_refresh(),
        }
    }
}

/// Stale-entry sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Inside longer than this without an event ⇒ automatic exit.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

fn default_stale_after() -> u64 {
    24 * 60 * 60
}
fn default_sweep_interval() -> u64 {
    30 * 60
}

impl Default for SweepSettings {
    fn default() -> Self {
        SweepSettings {
            stale_after_secs: default_stale_after(),
            interval_secs: default_sweep_interval(),
        }
    }
}

// =============================================================================
// Precision / Heartbeat / Battery / Remote
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionSettings {
    #[serde(default = "default_near_margin")]
    pub near_margin_m: f64,

    #[serde(default = "default_far_margin")]
    pub far_margin_m: f64,
}

fn default_near_margin() -> f64 {
    10.0
}
fn default_far_margin() -> f64 {
    400.0
}

impl Default for PrecisionSettings {
    fn default() -> Self {
        PrecisionSettings {
            near_margin_m: default_near_margin(),
            far_margin_m: default_far_margin(),
        }
    }
}

impl PrecisionSettings {
    pub fn controller(&self) -> PrecisionController {
        PrecisionController::new(self.near_margin_m, self.far_margin_m)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_beat_interval")]
    pub interval_secs: u64,

    /// How often the running monitor looks for its own stale beat.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Gap that counts as a missed shutdown while running.
    #[serde(default = "default_in_process_gap")]
    pub in_process_gap_secs: u64,

    /// Gap that counts as a missed shutdown at the next start.
    #[serde(default = "default_boot_gap")]
    pub boot_gap_secs: u64,
}

fn default_beat_interval() -> u64 {
    30
}
fn default_check_interval() -> u64 {
    60
}
fn default_in_process_gap() -> u64 {
    90
}
fn default_boot_gap() -> u64 {
    5 * 60
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        HeartbeatSettings {
            interval_secs: default_beat_interval(),
            check_interval_secs: default_check_interval(),
            in_process_gap_secs: default_in_process_gap(),
            boot_gap_secs: default_boot_gap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatterySettings {
    #[serde(default = "default_critical_percent")]
    pub critical_percent: u8,

    #[serde(default = "default_reset_percent")]
    pub reset_percent: u8,
}

fn default_critical_percent() -> u8 {
    3
}
fn default_reset_percent() -> u8 {
    15
}

impl Default for BatterySettings {
    fn default() -> Self {
        BatterySettings {
            critical_percent: default_critical_percent(),
            reset_percent: default_reset_percent(),
        }
    }
}

impl BatterySettings {
    pub fn guard(&self) -> BatteryGuard {
        BatteryGuard::new(self.critical_percent, self.reset_percent)
    }
}

/// Remote store calls: per-request timeout and startup fetch retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Any single remote call taking longer fails with `Timeout`.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Give up on the startup fetch after this long; the cache stays active.
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed_secs: u64,
}

fn default_request_timeout() -> u64 {
    10_000
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_max_elapsed() -> u64 {
    5 * 60
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            request_timeout_ms: default_request_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_elapsed_secs: default_max_elapsed(),
        }
    }
}

/// Where the local store lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Defaults to `waypost.db` in the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// Main Tracker Configuration
// =============================================================================

/// Complete tracker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub actor: ActorConfig,

    #[serde(default)]
    pub confirmation: ConfirmationSettings,

    #[serde(default)]
    pub dedup: DedupSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub zones: ZoneSettings,

    #[serde(default)]
    pub sweep: SweepSettings,

    #[serde(default)]
    pub precision: PrecisionSettings,

    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    #[serde(default)]
    pub battery: BatterySettings,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (waypost.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading tracker config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load tracker config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Tracker config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let c = &self.confirmation;
        if c.online_required_count == 0 || c.offline_required_count == 0 {
            return Err(SyncError::InvalidConfig(
                "required_count must be at least 1".into(),
            ));
        }

        if self.sync.interval_secs == 0 || self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "sync interval and batch_size must be greater than 0".into(),
            ));
        }

        let p = &self.precision;
        if !(p.near_margin_m >= 0.0 && p.far_margin_m > p.near_margin_m) {
            return Err(SyncError::InvalidConfig(format!(
                "far_margin_m ({}) must exceed near_margin_m ({})",
                p.far_margin_m, p.near_margin_m
            )));
        }

        let h = &self.heartbeat;
        if h.interval_secs == 0 || h.in_process_gap_secs <= h.interval_secs {
            return Err(SyncError::InvalidConfig(
                "in_process_gap_secs must exceed the heartbeat interval".into(),
            ));
        }

        if self.battery.reset_percent <= self.battery.critical_percent {
            return Err(SyncError::InvalidConfig(
                "battery reset_percent must exceed critical_percent".into(),
            ));
        }

        if self.sweep.stale_after_secs == 0 || self.sweep.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sweep intervals must be greater than 0".into(),
            ));
        }

        // Timer periods: zero panics the interval, huge overflows the clock
        let periods = [
            ("sync.interval_secs", self.sync.interval_secs),
            ("sync.cleanup_interval_secs", self.sync.cleanup_interval_secs),
            ("zones.refresh_interval_secs", self.zones.refresh_interval_secs),
            ("sweep.interval_secs", self.sweep.interval_secs),
            ("heartbeat.interval_secs", self.heartbeat.interval_secs),
            ("heartbeat.check_interval_secs", self.heartbeat.check_interval_secs),
        ];
        for (field, value) in periods {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!("{field} must be greater than 0")));
            }
        }
        if self.remote.request_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "remote.request_timeout_ms must be greater than 0".into(),
            ));
        }

        let bounded = [
            ("confirmation.online_min_interval_secs", c.online_min_interval_secs),
            ("confirmation.offline_min_interval_secs", c.offline_min_interval_secs),
            ("dedup.window_secs", self.dedup.window_secs),
            ("sync.cleanup_initial_delay_secs", self.sync.cleanup_initial_delay_secs),
            ("sweep.stale_after_secs", self.sweep.stale_after_secs),
            ("heartbeat.in_process_gap_secs", self.heartbeat.in_process_gap_secs),
            ("heartbeat.boot_gap_secs", self.heartbeat.boot_gap_secs),
            ("remote.max_backoff_secs", self.remote.max_backoff_secs),
            ("remote.max_elapsed_secs", self.remote.max_elapsed_secs),
            ("remote.request_timeout_ms", self.remote.request_timeout_ms / 1_000),
        ]
        .into_iter()
        .chain(periods);
        for (field, value) in bounded {
            if value > MAX_SETTING_SECS {
                return Err(SyncError::InvalidConfig(format!(
                    "{field} must be at most {MAX_SETTING_SECS} seconds"
                )));
            }
        }
        if self.sync.retention_days > MAX_RETENTION_DAYS {
            return Err(SyncError::InvalidConfig(format!(
                "sync.retention_days must be at most {MAX_RETENTION_DAYS}"
            )));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("WAYPOST_ACTOR_ID") {
            debug!(actor_id = %id, "Overriding actor id from environment");
            self.actor.id = id;
        }

        if let Ok(name) = std::env::var("WAYPOST_ACTOR_NAME") {
            self.actor.name = name;
        }

        if let Ok(tenant) = std::env::var("WAYPOST_TENANT_ID") {
            debug!(tenant = %tenant, "Overriding tenant from environment");
            self.actor.tenant_id = Some(tenant);
        }

        if let Ok(path) = std::env::var("WAYPOST_DB_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }

        if let Ok(secs) = std::env::var("WAYPOST_SYNC_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.sync.interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid WAYPOST_SYNC_INTERVAL_SECS"),
            }
        }

        if let Ok(secs) = std::env::var("WAYPOST_DEDUP_WINDOW_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.dedup.window_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid WAYPOST_DEDUP_WINDOW_SECS"),
            }
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "waypost", "tracker")
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("waypost.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Configured database path, else `waypost.db` in the data directory,
    /// else the working directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("waypost.db")))
            .unwrap_or_else(|| PathBuf::from("waypost.db"))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn retention(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.sync.retention_days))
    }

    pub fn stale_after(&self) -> ChronoDuration {
        secs(self.sweep.stale_after_secs)
    }

    pub fn boot_gap(&self) -> ChronoDuration {
        secs(self.heartbeat.boot_gap_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.request_timeout_ms)
    }

    pub fn in_process_gap(&self) -> ChronoDuration {
        secs(self.heartbeat.in_process_gap_secs)
    }
}

fn secs(value: u64) -> ChronoDuration {
    // Lossless: the bound fits in i64
    ChronoDuration::seconds(value.min(MAX_SETTING_SECS) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());

        let policies = config.confirmation.policies();
        assert_eq!(policies.online.required_count, 3);
        assert_eq!(policies.offline.min_interval, ChronoDuration::minutes(2));
        assert_eq!(config.dedup.window(), DedupWindow::default());
        assert_eq!(config.sync_interval(), Duration::from_secs(300));
        assert_eq!(config.retention(), ChronoDuration::days(7));
        assert_eq!(config.actor.tenant(), None);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let toml_str = r#"
            [actor]
            id = "emp-042"
            tenant_id = "  acme  "

            [confirmation]
            offline_required_count = 5
        "#;
        let config: TrackerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.actor.tenant().as_deref(), Some("acme"));
        assert_eq!(config.confirmation.offline_required_count, 5);
        assert_eq!(config.confirmation.online_required_count, 3);
        assert_eq!(config.heartbeat.boot_gap_secs, 300);

        // Blank name falls back to the sentinel
        assert_eq!(config.actor.actor().name, "Unknown actor");
    }

    #[test]
    fn test_config_validation() {
        let mut config = TrackerConfig::default();
        config.confirmation.online_required_count = 0;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.precision.far_margin_m = 5.0;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.battery.reset_percent = 2;
        assert!(config.validate().unwrap_err().is_config_error());

        // Zero timer periods would panic the worker intervals
        let mut config = TrackerConfig::default();
        config.heartbeat.check_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.zones.refresh_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.sync.cleanup_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.remote.request_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_rejected_and_clamped() {
        let mut config = TrackerConfig::default();
        config.sweep.stale_after_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.dedup.window_secs = i64::MAX as u64 / 100;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.sync.retention_days = u32::MAX;
        assert!(config.validate().is_err());

        // Unvalidated values never panic the conversion
        let mut config = TrackerConfig::default();
        config.sweep.stale_after_secs = i64::MAX as u64 / 100;
        assert_eq!(config.stale_after(), ChronoDuration::seconds(MAX_SETTING_SECS as i64));
        let _ = config.dedup.window();
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("waypost-config-{}", std::process::id()));
        let path = dir.join("waypost.toml");

        let mut config = TrackerConfig::default();
        config.actor.id = "emp-7".into();
        config.sync.interval_secs = 90;
        config.save(Some(path.clone())).unwrap();

        let loaded = TrackerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.sync.interval_secs, 90);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_toml_serialization() {
        let toml_str = toml::to_string_pretty(&TrackerConfig::default()).unwrap();
        assert!(toml_str.contains("[confirmation]"));
        assert!(toml_str.contains("[heartbeat]"));
    }
}
