//! Transport error types

use thiserror::Error;

/// Errors that can occur during transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Device is not open")]
    NotOpen,

    #[error("Communication timeout")]
    Timeout,

    // HID-specific errors
    #[error("HID error: {0}")]
    HidError(String),

    #[error("HID permission denied: {0}")]
    HidPermissionDenied(String),

    // Framing errors
    #[error("Payload of {len} bytes exceeds the {max} byte CTAPHID message limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// True when the host refused access to the device node
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, TransportError::HidPermissionDenied(_))
    }
}

impl From<hidapi::HidError> for TransportError {
    fn from(e: hidapi::HidError) -> Self {
        let msg = e.to_string();
        if msg.contains("Permission denied") || msg.contains("EPERM") || msg.contains("EACCES") {
            TransportError::HidPermissionDenied(msg)
        } else {
            TransportError::HidError(msg)
        }
    }
}
