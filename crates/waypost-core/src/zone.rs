//! # Zones
//!
//! Named circular regions and the in-memory registry of active zones.
//!
//! ## Record Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Where Zones Come From                           │
//! │                                                                         │
//! │  Remote document (loosely typed)        Local cache row (strict)       │
//! │  ───────────────────────────────        ─────────────────────────      │
//! │  { "NomeObra": "Site A",                { "code": "A-01",              │
//! │    "CodObra": "A-01",                     "name": "Site A",            │
//! │    "Latitude": "-23.55",                  "latitude": -23.55,          │
//! │    "Longitude": -46.63,                   "longitude": -46.63,         │
//! │    "Metros": 0 }                          "radius": 100.0 }            │
//! │        │                                        ▲                       │
//! │        ▼                                        │                       │
//! │  Zone::from_document ──► Zone::new ──► Zone ────┘ (serde)              │
//! │                          validates,                                     │
//! │                          defaults radius                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Remote records are accepted under either naming convention and with
//! numbers encoded as strings. A record that fails validation is rejected
//! on its own; the rest of the snapshot still loads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ValidationError, ValidationResult};
use crate::geo::Position;

/// Radius applied when a record carries a zero, negative or missing radius.
pub const DEFAULT_RADIUS_M: f64 = 100.0;

/// Both |lat| and |lng| at or under this value mark a record as unset.
pub const DEGENERATE_EPSILON_DEG: f64 = 0.0001;

const NAME_FIELDS: &[&str] = &["name", "NomeObra"];
const CODE_FIELDS: &[&str] = &["code", "codigo", "CodObra"];
const LATITUDE_FIELDS: &[&str] = &["latitude", "Latitude"];
const LONGITUDE_FIELDS: &[&str] = &["longitude", "Longitude"];
const RADIUS_FIELDS: &[&str] = &["radius", "Metros"];

// =============================================================================
// Zone
// =============================================================================

/// A named circular region.
///
/// The serde form is the local cache format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// Business identifier assigned by the backend.
    pub code: String,

    /// Display name. Collaborators look zones up by this name.
    pub name: String,

    pub latitude: f64,
    pub longitude: f64,

    /// Radius in metres. Always positive once constructed through `new`.
    #[serde(rename = "radius")]
    pub radius_m: f64,
}

impl Zone {
    /// Builds a validated zone.
    ///
    /// ## Rules
    /// - `code` and `name` must be non-blank
    /// - coordinates must be finite and in range
    /// - coordinates within 0.0001° of (0,0) on both axes are rejected
    /// - a non-positive or non-finite radius becomes [`DEFAULT_RADIUS_M`]
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
        radius_m: f64,
    ) -> ValidationResult<Self> {
        let code = code.into().trim().to_string();
        let name = name.into().trim().to_string();

        if code.is_empty() {
            return Err(ValidationError::required("code"));
        }
        if name.is_empty() {
            return Err(ValidationError::required("name"));
        }

        Position::new(latitude, longitude).validate()?;

        if latitude.abs() <= DEGENERATE_EPSILON_DEG && longitude.abs() <= DEGENERATE_EPSILON_DEG {
            return Err(ValidationError::DegenerateCoordinates {
                latitude,
                longitude,
            });
        }

        let radius_m = if radius_m.is_finite() && radius_m > 0.0 {
            radius_m
        } else {
            DEFAULT_RADIUS_M
        };

        Ok(Zone {
            code,
            name,
            latitude,
            longitude,
            radius_m,
        })
    }

    /// Parses a remote zone document.
    ///
    /// ## Example
    /// ```rust
    /// use waypost_core::zone::Zone;
    ///
    /// let doc = serde_json::json!({
    ///     "NomeObra": "Site A",
    ///     "CodObra": "A-01",
    ///     "Latitude": "-23.5505",
    ///     "Longitude": -46.6333,
    ///     "Metros": 0
    /// });
    /// let zone = Zone::from_document(&doc).unwrap();
    /// assert_eq!(zone.radius_m, 100.0);
    /// ```
    pub fn from_document(doc: &Value) -> ValidationResult<Self> {
        let name = string_field(doc, NAME_FIELDS).ok_or_else(|| ValidationError::required("name"))?;
        let code = string_field(doc, CODE_FIELDS).ok_or_else(|| ValidationError::required("code"))?;

        // Missing coordinates read as 0.0 and then fail the degenerate check
        let latitude = number_field(doc, LATITUDE_FIELDS)?.unwrap_or(0.0);
        let longitude = number_field(doc, LONGITUDE_FIELDS)?.unwrap_or(0.0);
        let radius = number_field(doc, RADIUS_FIELDS)?.unwrap_or(DEFAULT_RADIUS_M);

        Zone::new(code, name, latitude, longitude, radius)
    }

    pub fn center(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }

    /// Distance from the zone center to `position`, in metres.
    pub fn distance_to(&self, position: &Position) -> f64 {
        self.center().distance_to(position)
    }

    /// Inside test on a precomputed distance. The boundary itself is outside.
    pub fn contains_distance(&self, distance_m: f64) -> bool {
        distance_m < self.radius_m
    }

    pub fn contains(&self, position: &Position) -> bool {
        self.contains_distance(self.distance_to(position))
    }
}

/// First non-blank string among `fields`.
fn string_field(doc: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| match doc.get(*f) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// First non-zero number among `fields`, accepting numeric strings.
///
/// A zero under the primary name falls through to the alternate name, since
/// backends that write both conventions leave the unused one at 0.
fn number_field(doc: &Value, fields: &[&str]) -> ValidationResult<Option<f64>> {
    for field in fields {
        let parsed = match doc.get(*field) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) if !s.trim().is_empty() => {
                let value = s.trim().parse::<f64>().map_err(|e| ValidationError::InvalidFormat {
                    field: (*field).to_string(),
                    reason: e.to_string(),
                })?;
                Some(value)
            }
            _ => None,
        };
        if let Some(value) = parsed {
            if value != 0.0 {
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

// =============================================================================
// Zone Registry
// =============================================================================

/// A record rejected while parsing a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedZone {
    /// Position of the record in the snapshot.
    pub index: usize,
    pub reason: ValidationError,
}

/// The active set of zones, in backend order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneRegistry {
    zones: Vec<Zone>,
}

impl ZoneRegistry {
    pub fn new(zones: Vec<Zone>) -> Self {
        ZoneRegistry { zones }
    }

    /// Parses every document of a remote snapshot.
    ///
    /// Valid zones keep their snapshot order. Later duplicates of a code are
    /// dropped so lookups by code stay unambiguous.
    pub fn parse_snapshot(docs: &[Value]) -> (Vec<Zone>, Vec<RejectedZone>) {
        let mut zones: Vec<Zone> = Vec::with_capacity(docs.len());
        let mut rejected = Vec::new();

        for (index, doc) in docs.iter().enumerate() {
            match Zone::from_document(doc) {
                Ok(zone) if zones.iter().any(|z| z.code == zone.code) => {
                    rejected.push(RejectedZone {
                        index,
                        reason: ValidationError::InvalidFormat {
                            field: "code".to_string(),
                            reason: format!("duplicate code '{}'", zone.code),
                        },
                    });
                }
                Ok(zone) => zones.push(zone),
                Err(reason) => rejected.push(RejectedZone { index, reason }),
            }
        }

        (zones, rejected)
    }

    /// Replaces the active set. An empty set is ignored so a transient empty
    /// snapshot never wipes the zones a device is tracking.
    ///
    /// Returns true when the set was replaced.
    pub fn replace(&mut self, zones: Vec<Zone>) -> bool {
        if zones.is_empty() {
            return false;
        }
        self.zones = zones;
        true
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.name == name)
    }

    pub fn find_by_code(&self, code: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.code == code)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_defaults_radius() {
        let zone = Zone::new("A-01", "Site A", -23.5, -46.6, 0.0).unwrap();
        assert_eq!(zone.radius_m, DEFAULT_RADIUS_M);

        let zone = Zone::new("A-01", "Site A", -23.5, -46.6, -5.0).unwrap();
        assert_eq!(zone.radius_m, DEFAULT_RADIUS_M);

        let zone = Zone::new("A-01", "Site A", -23.5, -46.6, 250.0).unwrap();
        assert_eq!(zone.radius_m, 250.0);
    }

    #[test]
    fn test_new_rejects_invalid_records() {
        assert_eq!(
            Zone::new("", "Site", 1.0, 1.0, 10.0),
            Err(ValidationError::required("code"))
        );
        assert_eq!(
            Zone::new("C", "  ", 1.0, 1.0, 10.0),
            Err(ValidationError::required("name"))
        );
        assert!(matches!(
            Zone::new("C", "Site", 0.00005, -0.00002, 10.0),
            Err(ValidationError::DegenerateCoordinates { .. })
        ));
        assert!(matches!(
            Zone::new("C", "Site", 95.0, 1.0, 10.0),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(matches!(
            Zone::new("C", "Site", f64::INFINITY, 1.0, 10.0),
            Err(ValidationError::NotFinite { .. })
        ));
        // Near zero on one axis only is a real place
        assert!(Zone::new("C", "Site", 0.0, 32.5, 10.0).is_ok());
    }

    #[test]
    fn test_from_document_primary_fields() {
        let doc = json!({
            "name": "Warehouse",
            "codigo": "W-9",
            "latitude": 51.5,
            "longitude": -0.12,
            "radius": 75
        });
        let zone = Zone::from_document(&doc).unwrap();
        assert_eq!(zone.code, "W-9");
        assert_eq!(zone.name, "Warehouse");
        assert_eq!(zone.radius_m, 75.0);
    }

    #[test]
    fn test_from_document_alternate_fields_and_strings() {
        let doc = json!({
            "NomeObra": "Obra Centro",
            "CodObra": 1042,
            "latitude": 0,
            "Latitude": "-23.5505",
            "Longitude": " -46.6333 ",
            "Metros": "150"
        });
        let zone = Zone::from_document(&doc).unwrap();
        assert_eq!(zone.code, "1042");
        assert_eq!(zone.latitude, -23.5505);
        assert_eq!(zone.longitude, -46.6333);
        assert_eq!(zone.radius_m, 150.0);
    }

    #[test]
    fn test_from_document_rejections() {
        let missing_code = json!({ "name": "X", "latitude": 1.0, "longitude": 1.0 });
        assert_eq!(
            Zone::from_document(&missing_code),
            Err(ValidationError::required("code"))
        );

        let missing_coords = json!({ "name": "X", "code": "X" });
        assert!(matches!(
            Zone::from_document(&missing_coords),
            Err(ValidationError::DegenerateCoordinates { .. })
        ));

        let garbage = json!({ "name": "X", "code": "X", "latitude": "north", "longitude": 1.0 });
        assert!(matches!(
            Zone::from_document(&garbage),
            Err(ValidationError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_cache_format_round_trip() {
        let zone = Zone::new("A-01", "Site A", -23.5505, -46.6333, 120.5).unwrap();
        let cached = serde_json::to_value(&zone).unwrap();
        assert_eq!(cached["radius"], json!(120.5));

        let restored: Zone = serde_json::from_value(cached).unwrap();
        assert_eq!(restored, zone);
    }

    #[test]
    fn test_parse_snapshot_skips_bad_records() {
        let docs = vec![
            json!({ "name": "A", "code": "A", "latitude": 10.0, "longitude": 10.0 }),
            json!({ "name": "B", "latitude": 10.0, "longitude": 10.0 }),
            json!({ "name": "C", "code": "C", "latitude": 0.0, "longitude": 0.0 }),
            json!({ "name": "A again", "code": "A", "latitude": 11.0, "longitude": 11.0 }),
            json!({ "name": "D", "code": "D", "latitude": 12.0, "longitude": 12.0 }),
        ];
        let (zones, rejected) = ZoneRegistry::parse_snapshot(&docs);
        let codes: Vec<_> = zones.iter().map(|z| z.code.as_str()).collect();
        assert_eq!(codes, vec!["A", "D"]);
        let indexes: Vec<_> = rejected.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);

        // Rejections are kept for reporting after the snapshot is dropped
        let kept = rejected.clone();
        assert_eq!(kept, rejected);
        assert!(matches!(
            kept[1].reason,
            ValidationError::DegenerateCoordinates { .. }
        ));
    }

    #[test]
    fn test_registry_ignores_empty_replacement() {
        let mut registry = ZoneRegistry::default();
        let zone = Zone::new("A", "Site A", 10.0, 10.0, 50.0).unwrap();
        assert!(registry.replace(vec![zone.clone()]));
        assert!(!registry.replace(Vec::new()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_name("Site A"), Some(&zone));
        assert_eq!(registry.find_by_code("A"), Some(&zone));
        assert!(registry.find_by_name("Site B").is_none());
    }

    #[test]
    fn test_boundary_is_outside() {
        // Built directly: (0,0) is rejected by `new` but is a clean test geometry
        let zone = Zone {
            code: "Z".into(),
            name: "Origin".into(),
            latitude: 0.0,
            longitude: 0.0,
            radius_m: 100.0,
        };
        assert!(zone.contains_distance(99.999));
        assert!(!zone.contains_distance(100.0));
        assert!(!zone.contains_distance(150.0));
    }
}
