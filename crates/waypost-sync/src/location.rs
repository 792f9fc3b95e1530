//! Location provider seam.
//!
//! The tracker never reads a clock or a GPS; it is handed fixes and tells the
//! provider how densely to sample.

use async_trait::async_trait;
use tokio::sync::Mutex;

use waypost_core::precision::SamplingProfile;

use crate::error::SyncResult;

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Reconfigures the live subscription.
    async fn apply_profile(&self, profile: SamplingProfile) -> SyncResult<()>;
}

/// Keeps every profile it was given. Used by the replay tool and the tests.
#[derive(Default)]
pub struct RecordingLocationProvider {
    applied: Mutex<Vec<SamplingProfile>>,
}

impl RecordingLocationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn applied(&self) -> Vec<SamplingProfile> {
        self.applied.lock().await.clone()
    }

    pub async fn current(&self) -> Option<SamplingProfile> {
        self.applied.lock().await.last().copied()
    }
}

#[async_trait]
impl LocationProvider for RecordingLocationProvider {
    async fn apply_profile(&self, profile: SamplingProfile) -> SyncResult<()> {
        tracing::debug!(level = ?profile.level, interval = ?profile.interval, "Sampling profile applied");
        self.applied.lock().await.push(profile);
        Ok(())
    }
}
