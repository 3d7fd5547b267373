//! High-level entry point that serializes operations per key

use seedkey_transport::{InitResponse, Transport};
use tracing::debug;

use crate::error::SeedingError;
use crate::lock::DeviceLocks;
use crate::seed::SeedCommand;
use crate::session::SeedingTimeouts;
use crate::{ops, seed};

/// Runs key operations with configured timeouts, one at a time per device
#[derive(Debug, Default)]
pub struct KeySeeder {
    timeouts: SeedingTimeouts,
    locks: DeviceLocks,
}

impl KeySeeder {
    pub fn new(timeouts: SeedingTimeouts) -> Self {
        Self {
            timeouts,
            locks: DeviceLocks::new(),
        }
    }

    pub fn timeouts(&self) -> &SeedingTimeouts {
        &self.timeouts
    }

    /// True while an operation on this device is running or queued
    pub fn is_busy(&self, device: &dyn Transport) -> bool {
        self.locks.is_busy(&device.device_info().device_path)
    }

    /// See [`seed::write_seed`]
    pub async fn write_seed(
        &self,
        device: &dyn Transport,
        seed: &[u8],
        ext_state: &[u8],
    ) -> Result<(), SeedingError> {
        // Reject bad input without queueing behind another operation
        SeedCommand::new(seed, ext_state)?;

        let path = &device.device_info().device_path;
        let _guard = self.locks.acquire(path).await;
        debug!("Acquired {} for seeding", path);
        seed::write_seed(device, seed, ext_state, &self.timeouts).await
    }

    /// See [`ops::wink`]
    pub async fn wink(&self, device: &dyn Transport) -> Result<(), SeedingError> {
        let _guard = self.locks.acquire(&device.device_info().device_path).await;
        ops::wink(device, &self.timeouts).await
    }

    /// See [`ops::probe`]
    pub async fn probe(&self, device: &dyn Transport) -> Result<InitResponse, SeedingError> {
        let _guard = self.locks.acquire(&device.device_info().device_path).await;
        ops::probe(device, &self.timeouts).await
    }
}
