//! # Membership Evaluator
//!
//! Turns one fix into a per-zone inside/outside observation. Pure: no
//! state is read or written here, the confirmation state machine decides
//! what an observation means.

use crate::geo::Fix;
use crate::zone::Zone;

/// Where a single fix falls relative to one zone.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneObservation {
    pub zone_code: String,
    pub distance_m: f64,
    pub inside: bool,
}

/// Evaluates `fix` against every zone, in registry order.
///
/// Zero zones produce zero observations, and therefore no transitions.
pub fn evaluate(fix: &Fix, zones: &[Zone]) -> Vec<ZoneObservation> {
    let position = fix.position();
    zones
        .iter()
        .map(|zone| {
            let distance_m = zone.distance_to(&position);
            ZoneObservation {
                zone_code: zone.code.clone(),
                distance_m,
                inside: zone.contains_distance(distance_m),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{offset_north, Position};
    use chrono::Utc;

    fn origin_zone() -> Zone {
        Zone {
            code: "Z".into(),
            name: "Origin".into(),
            latitude: 0.0,
            longitude: 0.0,
            radius_m: 100.0,
        }
    }

    fn fix_at_distance(meters: f64) -> Fix {
        Fix::new(offset_north(&Position::new(0.0, 0.0), meters), 5.0, Utc::now())
    }

    #[test]
    fn test_inside_and_outside_of_origin_zone() {
        let zones = vec![origin_zone()];

        let near = evaluate(&fix_at_distance(50.0), &zones);
        assert_eq!(near.len(), 1);
        assert!(near[0].inside);
        assert!((near[0].distance_m - 50.0).abs() < 1e-6);

        let far = evaluate(&fix_at_distance(150.0), &zones);
        assert!(!far[0].inside);
    }

    #[test]
    fn test_no_zones_no_observations() {
        assert!(evaluate(&fix_at_distance(0.0), &[]).is_empty());
    }

    #[test]
    fn test_observations_follow_registry_order() {
        let mut second = origin_zone();
        second.code = "Y".into();
        second.latitude = 1.0;
        let zones = vec![origin_zone(), second];

        let obs = evaluate(&fix_at_distance(10.0), &zones);
        let codes: Vec<_> = obs.iter().map(|o| o.zone_code.as_str()).collect();
        assert_eq!(codes, vec!["Z", "Y"]);
        assert!(obs[0].inside);
        assert!(!obs[1].inside);
    }
}
