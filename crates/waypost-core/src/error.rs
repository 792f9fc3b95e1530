//! # Error Types
//!
//! Domain-specific error types for waypost-core.
//!
//! Nothing here is fatal to the pipeline. A zone that fails validation is
//! skipped, a fix that fails validation is dropped, and everything else
//! keeps running.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Presence logic errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Zone cannot be found in the active registry.
    ///
    /// ## When This Occurs
    /// - A collaborator asks for a zone by a name that was never loaded
    /// - The zone was removed by a later registry refresh
    #[error("Zone not found: {0}")]
    ZoneNotFound(String),

    /// Event kind string is not one of the known wire names.
    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors for zone records and location fixes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Numeric field is NaN or infinite.
    #[error("{field} must be a finite number")]
    NotFinite { field: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: String,
        min: f64,
        max: f64,
        value: f64,
    },

    /// Both coordinates are within a hair of (0,0).
    ///
    /// ## When This Occurs
    /// - Backend record saved before an address was geocoded
    /// - Default-initialised numeric fields on the remote side
    #[error("coordinates ({latitude}, {longitude}) are too close to (0,0)")]
    DegenerateCoordinates { latitude: f64, longitude: f64 },

    /// Invalid format (e.g., non-numeric string where a number belongs).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    pub(crate) fn required(field: &str) -> Self {
        ValidationError::Required {
            field: field.to_string(),
        }
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

/// Convenience type alias for Results with ValidationError.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ValidationError::OutOfRange {
            field: "latitude".to_string(),
            min: -90.0,
            max: 90.0,
            value: 91.5,
        };
        assert_eq!(
            err.to_string(),
            "latitude must be between -90 and 90, got 91.5"
        );

        let err = ValidationError::required("code");
        assert_eq!(err.to_string(), "code is required");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::required("name");
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
