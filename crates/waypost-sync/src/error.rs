//! # Sync Error Types
//!
//! Error types for the tracker runtime, grouped into configuration, remote,
//! storage and internal failures.
//!
//! The split between `Unavailable`/`Timeout` and `Rejected` drives the
//! drain: the first two end the pass, the last is recorded against the
//! entry and the pass moves on.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid tracker configuration.
    #[error("Invalid tracker configuration: {0}")]
    InvalidConfig(String),

    /// No tenant configured; remote writes are not possible.
    #[error("Tenant not configured")]
    MissingTenant,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// Remote store unreachable. Worth retrying later.
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// Remote call did not finish within the request timeout.
    #[error("Remote call timed out after {0} ms")]
    Timeout(u64),

    /// Remote store refused the write. Retrying the same payload won't help.
    #[error("Remote store rejected the request: {0}")]
    Rejected(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Local store failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Failed to serialize or deserialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<waypost_db::DbError> for SyncError {
    fn from(err: waypost_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried later.
    ///
    /// ## Retryable Errors
    /// - Remote store unreachable or slow
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Remote rejections
    /// - Bad payloads
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Unavailable(_) | SyncError::Timeout(_) | SyncError::ChannelError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingTenant
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Unavailable("offline".into()).is_retryable());
        assert!(SyncError::Timeout(15_000).is_retryable());

        assert!(!SyncError::Rejected("permission denied".into()).is_retryable());
        assert!(!SyncError::MissingTenant.is_retryable());
        assert!(!SyncError::SerializationFailed("bad".into()).is_retryable());
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::MissingTenant.is_config_error());
        assert!(SyncError::InvalidConfig("x".into()).is_config_error());
        assert!(!SyncError::Unavailable("x".into()).is_config_error());
    }
}
