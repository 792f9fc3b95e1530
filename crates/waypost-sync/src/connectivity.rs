//! Shared network-availability flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cheap-to-clone view of whether the remote store is reachable. Starts
/// offline until the platform reports otherwise.
#[derive(Debug, Clone, Default)]
pub struct Connectivity(Arc<AtomicBool>);

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Connectivity(Arc::new(AtomicBool::new(online)))
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Stores the new value. Returns true when this call restored the
    /// connection.
    pub fn set(&self, online: bool) -> bool {
        let was = self.0.swap(online, Ordering::AcqRel);
        online && !was
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_reported_once() {
        let c = Connectivity::default();
        assert!(!c.is_online());
        assert!(c.set(true));
        assert!(!c.set(true));
        assert!(!c.set(false));
        assert!(c.clone().set(true));
        assert!(c.is_online());
    }
}
