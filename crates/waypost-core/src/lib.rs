//! # waypost-core: Pure Presence Logic
//!
//! Decides when a tracked actor has really entered or left a zone. Every
//! function here is deterministic: time comes in as an argument, nothing
//! touches the clock, the disk or the network.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Waypost Architecture                             │
//! │                                                                         │
//! │  Location provider ──fix──►  waypost-sync (PresenceTracker)            │
//! │                                      │                                  │
//! │  ┌───────────────────────────────────▼─────────────────────────────┐   │
//! │  │               ★ waypost-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐  ┌────────────┐  ┌──────────────┐  ┌──────────┐ │   │
//! │  │   │   zone   │  │ membership │  │ confirmation │  │ precision│ │   │
//! │  │   │ Registry │─►│  evaluate  │─►│ PresenceState│  │Controller│ │   │
//! │  │   └──────────┘  └────────────┘  └──────┬───────┘  └──────────┘ │   │
//! │  │                                        │ Transition             │   │
//! │  │   ┌──────────┐  ┌────────────┐  ┌──────▼───────┐               │   │
//! │  │   │   geo    │  │ lifecycle  │  │    event     │               │   │
//! │  │   │haversine │  │ heartbeat  │  │PresenceEvent │               │   │
//! │  │   └──────────┘  └────────────┘  │ dedup rule   │               │   │
//! │  │                                 └──────────────┘               │   │
//! │  │   NO I/O • NO CLOCK • NO NETWORK • PURE FUNCTIONS               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                      │                                  │
//! │  ┌───────────────────────────────────▼─────────────────────────────┐   │
//! │  │                 waypost-db (Local Durable Store)                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`geo`] - Positions, fixes, haversine distance
//! - [`zone`] - Zone validation, remote record parsing, the registry
//! - [`membership`] - Per-fix inside/outside evaluation
//! - [`confirmation`] - Debounce state machine and exclusivity
//! - [`precision`] - Sampling profile selection
//! - [`event`] - Presence events and the duplicate rule
//! - [`lifecycle`] - Heartbeat, shutdown state, battery guard
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use waypost_core::confirmation::{ConfirmationPolicy, PresenceState};
//! use waypost_core::geo::Fix;
//! use waypost_core::zone::Zone;
//!
//! let zone = Zone::new("A-01", "Site A", -23.5505, -46.6333, 100.0).unwrap();
//! let zones = vec![zone.clone()];
//! let policy = ConfirmationPolicy::default();
//! let mut state = PresenceState::default();
//!
//! let start = Utc::now();
//! let mut transitions = Vec::new();
//! for minute in 0..3 {
//!     let fix = Fix::new(zone.center(), 5.0, start + Duration::minutes(minute));
//!     transitions.extend(state.step(&fix, &zones, &policy).transitions);
//! }
//! assert_eq!(transitions.len(), 1);
//! assert!(state.is_inside("A-01"));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod confirmation;
pub mod error;
pub mod event;
pub mod geo;
pub mod lifecycle;
pub mod membership;
pub mod precision;
pub mod zone;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use confirmation::{
    Candidate, ConfirmationPolicy, PolicySet, PresenceState, StepOutcome, Transition,
    TransitionReason, ZonePhase, ZoneTrack,
};
pub use error::{CoreError, CoreResult, ValidationError, ValidationResult};
pub use event::{
    is_duplicate, Actor, DedupKey, DedupWindow, EventKind, PresenceEvent, ProviderStatusEvent,
};
pub use geo::{Fix, Position};
pub use lifecycle::{
    detect_missed_shutdown, BatteryGuard, DetectionMethod, HeartbeatRecord, ShutdownCause,
    ShutdownState,
};
pub use precision::{AccuracyPriority, PrecisionController, PrecisionLevel, SamplingProfile};
pub use zone::{Zone, ZoneRegistry};
