//! # Presence Events
//!
//! Immutable records of confirmed or synthesized transitions, plus the
//! duplicate rule shared by the remote and local checks.
//!
//! ## Event Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Transition ──► PresenceEvent::from_transition                          │
//! │                        │                                                │
//! │                        ▼                                                │
//! │              ┌──────────────────┐   duplicate within window?           │
//! │              │   dedup check    │──────────────────────────► dropped    │
//! │              └────────┬─────────┘                                       │
//! │                       │ unique                                          │
//! │           ┌───────────┴────────────┐                                    │
//! │           ▼                        ▼                                    │
//! │     remote store            offline queue ──(sync)──► remote store      │
//! │                                                                         │
//! │  Two events are duplicates when zone, kind and actor match and their    │
//! │  timestamps differ by at most the window, in either direction.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::confirmation::Transition;
use crate::error::CoreError;
use crate::lifecycle::{DetectionMethod, ShutdownCause};
use crate::zone::Zone;

/// Recorded when the configured actor id is blank.
pub const UNKNOWN_ACTOR_ID: &str = "unknown_actor";

/// Recorded when the configured actor name is blank.
pub const UNKNOWN_ACTOR_NAME: &str = "Unknown actor";

/// Default symmetric dedup window.
pub const DEFAULT_DEDUP_WINDOW_SECS: i64 = 120;

// =============================================================================
// Event Kind
// =============================================================================

/// Type of a presence event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Entry,
    Exit,
    /// Stale-entry sweep.
    AutoExit,
    /// Forced by shutdown, critical battery or recovery.
    ShutdownExit,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Entry => "entry",
            EventKind::Exit => "exit",
            EventKind::AutoExit => "auto_exit",
            EventKind::ShutdownExit => "shutdown_exit",
        }
    }

    /// True for events the device synthesized without a confirming fix.
    pub fn is_automatic(&self) -> bool {
        matches!(self, EventKind::AutoExit | EventKind::ShutdownExit)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(EventKind::Entry),
            "exit" => Ok(EventKind::Exit),
            "auto_exit" => Ok(EventKind::AutoExit),
            "shutdown_exit" => Ok(EventKind::ShutdownExit),
            other => Err(CoreError::UnknownEventKind(other.to_string())),
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

/// The person or vehicle being tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
}

impl Actor {
    /// Builds an actor, substituting sentinels for blank fields so events
    /// are never discarded for lack of an identity.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into().trim().to_string();
        let name = name.into().trim().to_string();
        Actor {
            id: if id.is_empty() {
                UNKNOWN_ACTOR_ID.to_string()
            } else {
                id
            },
            name: if name.is_empty() {
                UNKNOWN_ACTOR_NAME.to_string()
            } else {
                name
            },
        }
    }

    pub fn is_known(&self) -> bool {
        self.id != UNKNOWN_ACTOR_ID
    }
}

// =============================================================================
// Presence Event
// =============================================================================

/// A zone entry or exit, ready to be stored or uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// Locally generated id. Also the offline queue key.
    pub local_id: String,

    pub kind: EventKind,
    pub zone_code: String,
    pub zone_name: String,

    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,

    pub occurred_at: DateTime<Utc>,

    pub actor_id: String,
    pub actor_name: String,

    pub is_automatic: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<ShutdownCause>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_method: Option<DetectionMethod>,

    /// Set when the event reached the remote store through the offline queue.
    #[serde(default)]
    pub offline_sync: bool,
}

impl PresenceEvent {
    /// Builds the event for a transition.
    ///
    /// `zone` is looked up by the caller; when the zone has left the registry
    /// its code doubles as the name.
    pub fn from_transition(
        transition: &Transition,
        zone: Option<&Zone>,
        actor: &Actor,
        accuracy_m: f64,
    ) -> Self {
        PresenceEvent {
            local_id: Uuid::new_v4().to_string(),
            kind: transition.kind,
            zone_code: transition.zone_code.clone(),
            zone_name: zone.map_or_else(|| transition.zone_code.clone(), |z| z.name.clone()),
            latitude: transition.position.latitude,
            longitude: transition.position.longitude,
            accuracy_m,
            occurred_at: transition.at,
            actor_id: actor.id.clone(),
            actor_name: actor.name.clone(),
            is_automatic: transition.kind.is_automatic(),
            cause: None,
            detection_method: None,
            offline_sync: false,
        }
    }

    /// Tags a synthesized shutdown exit.
    pub fn with_shutdown(mut self, cause: ShutdownCause, detection: DetectionMethod) -> Self {
        self.is_automatic = true;
        self.cause = Some(cause);
        self.detection_method = Some(detection);
        self
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            zone_code: self.zone_code.clone(),
            kind: self.kind,
            actor_id: self.actor_id.clone(),
        }
    }
}

// =============================================================================
// Deduplication
// =============================================================================

/// Fields that must match for two events to be duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub zone_code: String,
    pub kind: EventKind,
    pub actor_id: String,
}

/// Symmetric time window around an event timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupWindow(Duration);

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        DedupWindow(window.abs())
    }

    pub fn from_secs(secs: i64) -> Self {
        DedupWindow::new(Duration::seconds(secs))
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Inclusive `[at - window, at + window]`.
    pub fn range(&self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (at - self.0, at + self.0)
    }

    pub fn contains(&self, at: DateTime<Utc>, other: DateTime<Utc>) -> bool {
        (at - other).abs() <= self.0
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        DedupWindow::from_secs(DEFAULT_DEDUP_WINDOW_SECS)
    }
}

/// True when `a` and `b` describe the same real-world event.
pub fn is_duplicate(a: &PresenceEvent, b: &PresenceEvent, window: DedupWindow) -> bool {
    a.dedup_key() == b.dedup_key() && window.contains(a.occurred_at, b.occurred_at)
}

// =============================================================================
// Provider Status Event
// =============================================================================

/// Location provider switched on or off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatusEvent {
    pub local_id: String,
    pub enabled: bool,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: String,
    pub actor_name: String,
}

impl ProviderStatusEvent {
    pub fn new(enabled: bool, actor: &Actor, at: DateTime<Utc>) -> Self {
        let message = if enabled {
            "Location provider enabled"
        } else {
            "Location provider disabled"
        };
        ProviderStatusEvent {
            local_id: Uuid::new_v4().to_string(),
            enabled,
            message: message.to_string(),
            occurred_at: at,
            actor_id: actor.id.clone(),
            actor_name: actor.name.clone(),
        }
    }

    /// Wire name of the status change.
    pub fn kind(&self) -> &'static str {
        if self.enabled {
            "provider_enabled"
        } else {
            "provider_disabled"
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::TransitionReason;
    use crate::geo::Position;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn event(kind: EventKind, zone: &str, secs: i64) -> PresenceEvent {
        let transition = Transition {
            kind,
            zone_code: zone.to_string(),
            position: Position::new(1.0, 2.0),
            at: t0() + Duration::seconds(secs),
            reason: TransitionReason::Confirmed,
        };
        PresenceEvent::from_transition(&transition, None, &Actor::new("u-1", "Ana"), 4.0)
    }

    #[test]
    fn test_duplicate_window_is_symmetric_and_inclusive() {
        let window = DedupWindow::default();
        let base = event(EventKind::Entry, "A", 0);

        assert!(is_duplicate(&base, &event(EventKind::Entry, "A", 120), window));
        assert!(is_duplicate(&base, &event(EventKind::Entry, "A", -120), window));
        assert!(!is_duplicate(&base, &event(EventKind::Entry, "A", 121), window));
        assert!(!is_duplicate(&base, &event(EventKind::Exit, "A", 10), window));
        assert!(!is_duplicate(&base, &event(EventKind::Entry, "B", 10), window));
    }

    #[test]
    fn test_actor_sentinels() {
        let actor = Actor::new("  ", "");
        assert_eq!(actor.id, UNKNOWN_ACTOR_ID);
        assert_eq!(actor.name, UNKNOWN_ACTOR_NAME);
        assert!(!actor.is_known());
        assert!(Actor::new("u-1", "Ana").is_known());
    }

    #[test]
    fn test_from_transition_fields() {
        let ev = event(EventKind::AutoExit, "A", 0);
        assert_eq!(ev.zone_name, "A");
        assert!(ev.is_automatic);
        assert_eq!(ev.latitude, 1.0);
        assert!(Uuid::parse_str(&ev.local_id).is_ok());

        let ev = event(EventKind::Exit, "A", 0)
            .with_shutdown(ShutdownCause::Battery, DetectionMethod::BatteryCritical);
        assert!(ev.is_automatic);
        assert_eq!(ev.cause, Some(ShutdownCause::Battery));
    }

    #[test]
    fn test_kind_wire_names() {
        for kind in [
            EventKind::Entry,
            EventKind::Exit,
            EventKind::AutoExit,
            EventKind::ShutdownExit,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::Value::String(kind.to_string())
            );
        }
        assert!("teleport".parse::<EventKind>().is_err());
    }
}
