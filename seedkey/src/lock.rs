//! Per-device single-flight locks
//!
//! A key can only run one CTAPHID transaction at a time; a second host-side
//! operation on the same device path waits for the first to finish.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

/// Registry of async locks keyed by device path
#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, device_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        // Drop entries nobody holds or waits on
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(device_path.to_string()).or_default())
    }

    /// Wait until no other operation holds `device_path`
    pub async fn acquire(&self, device_path: &str) -> OwnedMutexGuard<()> {
        self.lock_for(device_path).lock_owned().await
    }

    /// Take the lock only if it's free right now
    pub fn try_acquire(&self, device_path: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(device_path).try_lock_owned().ok()
    }

    /// True while an operation holds (or waits for) `device_path`
    pub fn is_busy(&self, device_path: &str) -> bool {
        self.locks
            .lock()
            .get(device_path)
            .is_some_and(|lock| Arc::strong_count(lock) > 1)
    }
}
