//! # Geodesy
//!
//! Positions, location fixes and great-circle distance.
//!
//! Distances use the haversine formula on a spherical Earth with the IUGG
//! mean radius. For zone radii of tens to hundreds of metres the error
//! against the WGS-84 ellipsoid is well below typical GPS accuracy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// Mean Earth radius in metres (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

// =============================================================================
// Position
// =============================================================================

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Position {
            latitude,
            longitude,
        }
    }

    /// Checks that both coordinates are finite and inside their ranges.
    pub fn validate(&self) -> ValidationResult<()> {
        check_coordinate("latitude", self.latitude, 90.0)?;
        check_coordinate("longitude", self.longitude, 180.0)?;
        Ok(())
    }

    /// Great-circle distance to `other` in metres.
    pub fn distance_to(&self, other: &Position) -> f64 {
        haversine_distance_m(self, other)
    }
}

fn check_coordinate(field: &str, value: f64, limit: f64) -> ValidationResult<()> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite {
            field: field.to_string(),
        });
    }
    if !(-limit..=limit).contains(&value) {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: -limit,
            max: limit,
            value,
        });
    }
    Ok(())
}

/// Haversine great-circle distance between two positions, in metres.
///
/// ## Example
/// ```rust
/// use waypost_core::geo::{haversine_distance_m, Position};
///
/// let a = Position::new(0.0, 0.0);
/// let b = Position::new(0.0, 1.0);
/// let d = haversine_distance_m(&a, &b);
/// assert!((d - 111_195.0).abs() < 1.0);
/// ```
pub fn haversine_distance_m(a: &Position, b: &Position) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lng = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push h a hair above 1 for antipodal points
    let h = h.clamp(0.0, 1.0);

    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Returns the position `meters` due north of `origin`.
///
/// Used to build fixes at a known distance from a zone center.
pub fn offset_north(origin: &Position, meters: f64) -> Position {
    let d_lat = (meters / EARTH_RADIUS_M).to_degrees();
    Position::new(origin.latitude + d_lat, origin.longitude)
}

// =============================================================================
// Location Fix
// =============================================================================

/// A single location sample delivered by the location provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,

    /// Horizontal accuracy radius reported by the provider, in metres.
    #[serde(default)]
    pub accuracy_m: f64,

    pub timestamp: DateTime<Utc>,
}

impl Fix {
    pub fn new(position: Position, accuracy_m: f64, timestamp: DateTime<Utc>) -> Self {
        Fix {
            latitude: position.latitude,
            longitude: position.longitude,
            accuracy_m,
            timestamp,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }

    /// Rejects fixes with non-finite or out-of-range coordinates.
    pub fn validate(&self) -> ValidationResult<()> {
        self.position().validate()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_zero_for_same_point() {
        let p = Position::new(-23.55, -46.63);
        assert_eq!(haversine_distance_m(&p, &p), 0.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = Position::new(-23.5505, -46.6333);
        let b = Position::new(-22.9068, -43.1729);
        let ab = haversine_distance_m(&a, &b);
        let ba = haversine_distance_m(&b, &a);
        assert!((ab - ba).abs() < 1e-6);
        // São Paulo to Rio is roughly 360 km
        assert!(ab > 350_000.0 && ab < 370_000.0);
    }

    #[test]
    fn test_offset_north_round_trips_distance() {
        let origin = Position::new(0.0, 0.0);
        for meters in [1.0, 50.0, 150.0, 5_000.0] {
            let p = offset_north(&origin, meters);
            let d = haversine_distance_m(&origin, &p);
            assert!((d - meters).abs() < 1e-6, "{meters} -> {d}");
        }
    }

    #[test]
    fn test_position_validation() {
        assert!(Position::new(45.0, 170.0).validate().is_ok());
        assert!(Position::new(90.5, 0.0).validate().is_err());
        assert!(Position::new(0.0, -181.0).validate().is_err());
        assert!(matches!(
            Position::new(f64::NAN, 0.0).validate(),
            Err(ValidationError::NotFinite { .. })
        ));
    }
}
