//! Common types for transport layer

use serde::{Deserialize, Serialize};

use crate::protocol::REPORT_SIZE;

/// One raw HID report exchanged with the device (report ID excluded)
pub type Report = [u8; REPORT_SIZE];

/// Device identification information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDeviceInfo {
    /// USB Vendor ID
    pub vid: u16,
    /// USB Product ID
    pub pid: u16,
    /// Platform device path (hidraw node, IOKit path, ...)
    pub device_path: String,
    /// Serial number if available
    pub serial: Option<String>,
    /// Product name if available
    pub product_name: Option<String>,
    /// HID usage page of this interface (0 when the backend doesn't report it)
    #[serde(default)]
    pub usage_page: u16,
}

impl TransportDeviceInfo {
    /// Deduplication key for this device under the given strategy.
    ///
    /// Format is `"{pid}:{vid}:{discriminator}"`, with an empty discriminator
    /// when the device doesn't report the selected string.
    pub fn identity_key(&self, kind: DeviceKeyKind) -> String {
        let discriminator = match kind {
            DeviceKeyKind::SerialNumber => self.serial.as_deref(),
            DeviceKeyKind::ProductName => self.product_name.as_deref(),
        };
        format!("{}:{}:{}", self.pid, self.vid, discriminator.unwrap_or(""))
    }

    /// Human readable label for listings
    pub fn display_name(&self) -> String {
        match (&self.product_name, &self.serial) {
            (Some(name), Some(serial)) => format!("{name} ({serial})"),
            (Some(name), None) => name.clone(),
            (None, Some(serial)) => format!("{:04x}:{:04x} ({serial})", self.vid, self.pid),
            (None, None) => format!("{:04x}:{:04x}", self.vid, self.pid),
        }
    }
}

/// Which device string disambiguates two keys with the same VID/PID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKeyKind {
    /// USB-level identity (distinguishes two keys of the same model)
    #[default]
    SerialNumber,
    /// HID-level identity
    ProductName,
}

/// Discovery events for hot-plug support
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A device was added
    DeviceAdded(TransportDeviceInfo),
    /// A device was removed
    DeviceRemoved(TransportDeviceInfo),
}
