//! Transport layer for seedable FIDO security keys
//!
//! This crate covers everything between raw USB HID reports and logical
//! CTAPHID messages:
//!
//! - CTAPHID framing (init/continuation frames, reassembly)
//! - HID transport over hidapi with a report reader thread
//! - Device discovery and hot-plug watching
//! - The registry of keys that accept a seed

pub mod device_registry;
pub mod error;
pub mod printer;
pub mod protocol;
pub mod types;

mod discovery;
mod hid;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use device_registry::{is_eligible, is_seedable, FIDO_USAGE_PAGE, SEEDABLE_DEVICES};
pub use discovery::{DeviceDiscovery, HidDiscovery, HotplugWatch};
pub use error::TransportError;
pub use hid::{HidTransport, ReportReaderConfig};
pub use printer::{PacketFilter, PrinterConfig, PrinterTransport};
pub use protocol::{Channel, DecodedFrame, InitResponse, Message, MessageAssembler};
pub use types::{DeviceKeyKind, DiscoveryEvent, Report, TransportDeviceInfo};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// The core transport trait - one physical key
///
/// A transport starts closed. Reports can only be exchanged between `open`
/// and `close`; each open/close pair is one session with the device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get device information
    fn device_info(&self) -> &TransportDeviceInfo;

    /// Acquire the device for exclusive use by this process
    async fn open(&self) -> Result<(), TransportError>;

    /// Check if `open` succeeded and `close` hasn't been called since
    fn is_open(&self) -> bool;

    /// Send one 64-byte report (report ID 0)
    async fn send_report(&self, report: &Report) -> Result<(), TransportError>;

    /// Register a listener for inbound reports
    ///
    /// Reports received before this call are not replayed, so subscribe
    /// before sending the request a response is expected for. Dropping the
    /// receiver removes the listener.
    fn subscribe_reports(&self) -> Result<broadcast::Receiver<Report>, TransportError>;

    /// Release the device
    async fn close(&self) -> Result<(), TransportError>;
}

/// Type alias for a shared transport
pub type BoxedTransport = Arc<dyn Transport>;

/// Encode a message and send its frames in order.
///
/// Returns the number of frames sent. The first send failure aborts the
/// message; frames already sent are not retracted.
pub async fn send_message(
    transport: &dyn Transport,
    channel: Channel,
    command: u8,
    payload: &[u8],
) -> Result<usize, TransportError> {
    let frames = protocol::encode(channel, command, payload)?;
    for frame in &frames {
        transport.send_report(frame).await?;
    }
    Ok(frames.len())
}
