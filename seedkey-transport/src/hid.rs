//! HID transport for FIDO keys over hidapi
//!
//! A key is opened by device path. While open, a dedicated reader thread
//! pulls 64-byte input reports and broadcasts them; every subscriber sees
//! every report received after it subscribed.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::{self, REPORT_SIZE};
use crate::types::{Report, TransportDeviceInfo};
use crate::Transport;

/// Broadcast channel capacity for inbound reports
const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Configuration for the report reader loop
#[derive(Debug, Clone)]
pub struct ReportReaderConfig {
    /// Read timeout in milliseconds (bounds how long a write waits for the device lock)
    pub read_timeout_ms: i32,
    /// Sleep duration on error before retrying
    pub error_sleep_ms: u64,
}

impl Default for ReportReaderConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10,
            error_sleep_ms: 100,
        }
    }
}

/// State that only exists while the device is open
struct OpenDevice {
    device: Arc<Mutex<HidDevice>>,
    report_tx: broadcast::Sender<Report>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl OpenDevice {
    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("HID report reader thread panicked");
            }
        }
    }
}

/// HID transport for a FIDO key connected over USB
pub struct HidTransport {
    info: TransportDeviceInfo,
    reader_config: ReportReaderConfig,
    open: Mutex<Option<OpenDevice>>,
}

impl HidTransport {
    /// Create a closed transport for a discovered device
    pub fn new(info: TransportDeviceInfo) -> Self {
        Self {
            info,
            reader_config: ReportReaderConfig::default(),
            open: Mutex::new(None),
        }
    }

    /// Override reader loop timing
    pub fn with_reader_config(mut self, config: ReportReaderConfig) -> Self {
        self.reader_config = config;
        self
    }

    fn open_hid_device(&self) -> Result<HidDevice, TransportError> {
        let api = HidApi::new()?;
        let path = CString::new(self.info.device_path.as_str()).map_err(|_| {
            TransportError::DeviceNotFound(format!("invalid device path {:?}", self.info.device_path))
        })?;
        Ok(api.open_path(&path)?)
    }
}

#[async_trait]
impl Transport for HidTransport {
    fn device_info(&self) -> &TransportDeviceInfo {
        &self.info
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut open = self.open.lock();
        if open.is_some() {
            debug!("{} already open", self.info.device_path);
            return Ok(());
        }

        let device = Arc::new(Mutex::new(self.open_hid_device()?));
        let (report_tx, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader = {
            let device = Arc::clone(&device);
            let tx = report_tx.clone();
            let shutdown = Arc::clone(&shutdown);
            let config = self.reader_config.clone();
            std::thread::Builder::new()
                .name("hid-report-reader".into())
                .spawn(move || run_report_reader_loop(device, tx, shutdown, config))
                .map_err(|e| TransportError::Internal(format!("spawn reader thread: {e}")))?
        };

        debug!(
            "Opened {:04X}:{:04X} at {}",
            self.info.vid, self.info.pid, self.info.device_path
        );
        *open = Some(OpenDevice {
            device,
            report_tx,
            shutdown,
            reader: Some(reader),
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.lock().is_some()
    }

    async fn send_report(&self, report: &Report) -> Result<(), TransportError> {
        let device = match self.open.lock().as_ref() {
            Some(open) => Arc::clone(&open.device),
            None => return Err(TransportError::NotOpen),
        };

        let buf = output_report(report);

        let frame = protocol::decode(report);
        debug!(
            "Sending frame cid={} init={} cmd/seq=0x{:02X}",
            frame.channel, frame.is_initialization, frame.command
        );

        let written = device.lock().write(&buf)?;
        check_written(written, buf.len())
    }

    fn subscribe_reports(&self) -> Result<broadcast::Receiver<Report>, TransportError> {
        self.open
            .lock()
            .as_ref()
            .map(|open| open.report_tx.subscribe())
            .ok_or(TransportError::NotOpen)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let taken = self.open.lock().take();
        match taken {
            Some(mut open) => {
                open.stop();
                debug!("Closed {}", self.info.device_path);
                Ok(())
            }
            None => Err(TransportError::NotOpen),
        }
    }
}

impl Drop for HidTransport {
    fn drop(&mut self) {
        if let Some(open) = self.open.get_mut() {
            // Don't join here; the reader notices within one read timeout
            open.shutdown.store(true, Ordering::SeqCst);
            debug!("HidTransport dropped while open, signaling reader shutdown");
        }
    }
}

/// Reader loop: forwards every input report to subscribers until shutdown.
///
/// The device lock is held only for one bounded read, so writers interleave
/// between reads.
fn run_report_reader_loop(
    device: Arc<Mutex<HidDevice>>,
    tx: broadcast::Sender<Report>,
    shutdown: Arc<AtomicBool>,
    config: ReportReaderConfig,
) {
    debug!("HID report reader started");
    let mut buf = [0u8; REPORT_SIZE];

    while !shutdown.load(Ordering::Relaxed) {
        let result = device.lock().read_timeout(&mut buf, config.read_timeout_ms);
        match result {
            Ok(len) if len > 0 => {
                let mut report = [0u8; REPORT_SIZE];
                let len = len.min(REPORT_SIZE);
                report[..len].copy_from_slice(&buf[..len]);
                debug!("Report reader got {} bytes: {:02X?}", len, &report[..len.min(16)]);
                // No receivers is fine; nobody is waiting for a response
                let _ = tx.send(report);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("HID report reader error: {}", e);
                std::thread::sleep(Duration::from_millis(config.error_sleep_ms));
            }
        }
    }

    debug!("HID report reader exiting");
}

/// Output buffer for hidapi: report ID 0 prefix, not part of the 64-byte frame
fn output_report(report: &Report) -> [u8; REPORT_SIZE + 1] {
    let mut buf = [0u8; REPORT_SIZE + 1];
    buf[1..].copy_from_slice(report);
    buf
}

fn check_written(written: usize, expected: usize) -> Result<(), TransportError> {
    if written < expected {
        return Err(TransportError::HidError(format!(
            "short write: {written} of {expected} bytes"
        )));
    }
    Ok(())
}
