//! # Precision Controller
//!
//! Chooses how often and how accurately to sample location, based on how
//! close the last fix is to any zone boundary.
//!
//! ## Classification
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │         ┌───── radius ─────┐── near ──┐──────── far margin ───────┐    │
//! │  center ●                  │  margin  │                           │    │
//! │         │   INSIDE_ANY     │ NEAR_SOME│       INTERMEDIATE        │ FAR│
//! │         │   → LOW          │ → HIGH   │       → LOW               │ →  │
//! │         │                  │          │                           │ VERY_LOW
//! │                                                                         │
//! │  Inside any zone wins. Otherwise near any zone wins. FAR only when the  │
//! │  fix is beyond radius + far margin for every zone.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The boundary band is where a crossing is about to be debounced, so that
//! is where samples are densest.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geo::Fix;
use crate::zone::Zone;

/// Default band outside the radius that counts as near.
pub const DEFAULT_NEAR_MARGIN_M: f64 = 10.0;

/// Default band outside the radius beyond which a fix is far.
pub const DEFAULT_FAR_MARGIN_M: f64 = 400.0;

/// Where a fix sits relative to the whole zone set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProximityClass {
    InsideAny,
    NearSome,
    FarFromAll,
    Intermediate,
}

/// Sampling tier requested from the location provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionLevel {
    High,
    Low,
    VeryLow,
}

impl From<ProximityClass> for PrecisionLevel {
    fn from(class: ProximityClass) -> Self {
        match class {
            ProximityClass::InsideAny => PrecisionLevel::Low,
            ProximityClass::NearSome => PrecisionLevel::High,
            ProximityClass::FarFromAll => PrecisionLevel::VeryLow,
            ProximityClass::Intermediate => PrecisionLevel::Low,
        }
    }
}

/// Provider-side accuracy/power tradeoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyPriority {
    HighAccuracy,
    Balanced,
    LowPower,
}

/// Request profile handed to the location provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingProfile {
    pub level: PrecisionLevel,
    /// Minimum interval between fixes.
    pub interval: Duration,
    /// Longest the provider may batch fixes before delivering them.
    pub max_delay: Duration,
    pub priority: AccuracyPriority,
}

impl SamplingProfile {
    pub fn for_level(level: PrecisionLevel) -> Self {
        let (interval, max_delay, priority) = match level {
            PrecisionLevel::High => (60, 5 * 60, AccuracyPriority::HighAccuracy),
            PrecisionLevel::Low => (2 * 60, 10 * 60, AccuracyPriority::Balanced),
            PrecisionLevel::VeryLow => (2 * 60, 5 * 60, AccuracyPriority::LowPower),
        };
        SamplingProfile {
            level,
            interval: Duration::from_secs(interval),
            max_delay: Duration::from_secs(max_delay),
            priority,
        }
    }
}

/// Classifies `fix` against every zone.
pub fn classify(fix: &Fix, zones: &[Zone], near_margin_m: f64, far_margin_m: f64) -> ProximityClass {
    let position = fix.position();
    let mut near = false;
    let mut far_from_all = true;

    for zone in zones {
        let distance = zone.distance_to(&position);
        if zone.contains_distance(distance) {
            return ProximityClass::InsideAny;
        }
        if distance < zone.radius_m + near_margin_m {
            near = true;
        }
        if distance < zone.radius_m + far_margin_m {
            far_from_all = false;
        }
    }

    if near {
        ProximityClass::NearSome
    } else if far_from_all {
        ProximityClass::FarFromAll
    } else {
        ProximityClass::Intermediate
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Tracks the active sampling level and reports when it must change.
#[derive(Debug, Clone)]
pub struct PrecisionController {
    near_margin_m: f64,
    far_margin_m: f64,
    current: Option<PrecisionLevel>,
}

impl PrecisionController {
    pub fn new(near_margin_m: f64, far_margin_m: f64) -> Self {
        PrecisionController {
            near_margin_m,
            far_margin_m,
            current: None,
        }
    }

    pub fn current(&self) -> Option<PrecisionLevel> {
        self.current
    }

    /// Returns the new profile when the fix calls for a different level,
    /// `None` when the live subscription can stay as it is.
    pub fn update(&mut self, fix: &Fix, zones: &[Zone]) -> Option<SamplingProfile> {
        let level = PrecisionLevel::from(classify(fix, zones, self.near_margin_m, self.far_margin_m));
        if self.current == Some(level) {
            return None;
        }
        self.current = Some(level);
        Some(SamplingProfile::for_level(level))
    }

    /// Forgets the active level so the next fix reconfigures the provider.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

impl Default for PrecisionController {
    fn default() -> Self {
        PrecisionController::new(DEFAULT_NEAR_MARGIN_M, DEFAULT_FAR_MARGIN_M)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{offset_north, Position};
    use chrono::Utc;

    fn zone_at(latitude: f64) -> Zone {
        Zone {
            code: format!("Z{latitude}"),
            name: "Z".into(),
            latitude,
            longitude: 10.0,
            radius_m: 100.0,
        }
    }

    fn fix_from(zone: &Zone, meters: f64) -> Fix {
        Fix::new(offset_north(&zone.center(), meters), 5.0, Utc::now())
    }

    #[test]
    fn test_classification_bands() {
        let z = zone_at(10.0);
        let zones = vec![z.clone()];
        let c = |m| classify(&fix_from(&z, m), &zones, 10.0, 400.0);

        assert_eq!(c(50.0), ProximityClass::InsideAny);
        assert_eq!(c(105.0), ProximityClass::NearSome);
        assert_eq!(c(300.0), ProximityClass::Intermediate);
        assert_eq!(c(600.0), ProximityClass::FarFromAll);
    }

    #[test]
    fn test_no_zones_is_far() {
        let f = Fix::new(Position::new(1.0, 1.0), 5.0, Utc::now());
        assert_eq!(classify(&f, &[], 10.0, 400.0), ProximityClass::FarFromAll);
    }

    #[test]
    fn test_inside_one_wins_over_near_another() {
        let a = zone_at(10.0);
        let b = zone_at(10.0018); // ~200 m north
        let zones = vec![b.clone(), a.clone()];
        // 95 m north of A: inside A, ~105 m from B
        let f = fix_from(&a, 95.0);
        assert_eq!(classify(&f, &zones, 10.0, 400.0), ProximityClass::InsideAny);
    }

    #[test]
    fn test_profiles() {
        let high = SamplingProfile::for_level(PrecisionLevel::High);
        assert_eq!(high.interval, Duration::from_secs(60));
        assert_eq!(high.max_delay, Duration::from_secs(300));
        assert_eq!(high.priority, AccuracyPriority::HighAccuracy);

        let very_low = SamplingProfile::for_level(PrecisionLevel::VeryLow);
        assert_eq!(very_low.interval, Duration::from_secs(120));
        assert_eq!(very_low.priority, AccuracyPriority::LowPower);
    }

    #[test]
    fn test_controller_reconfigures_only_on_change() {
        let z = zone_at(10.0);
        let zones = vec![z.clone()];
        let mut controller = PrecisionController::default();

        let first = controller.update(&fix_from(&z, 1_000.0), &zones);
        assert_eq!(first.map(|p| p.level), Some(PrecisionLevel::VeryLow));
        assert!(controller.update(&fix_from(&z, 900.0), &zones).is_none());

        let near = controller.update(&fix_from(&z, 104.0), &zones);
        assert_eq!(near.map(|p| p.level), Some(PrecisionLevel::High));

        // Inside and intermediate share the LOW tier
        let inside = controller.update(&fix_from(&z, 10.0), &zones);
        assert_eq!(inside.map(|p| p.level), Some(PrecisionLevel::Low));
        assert!(controller.update(&fix_from(&z, 300.0), &zones).is_none());
    }
}
