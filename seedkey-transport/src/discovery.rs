//! Device discovery and hot-plug watching for FIDO keys

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hidapi::HidApi;
use tokio::sync::{broadcast, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::device_registry;
use crate::error::TransportError;
use crate::hid::HidTransport;
use crate::printer::{PrinterConfig, PrinterTransport};
use crate::types::{DiscoveryEvent, TransportDeviceInfo};
use crate::Transport;

/// Default interval between hot-plug rescans
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Broadcast channel capacity for discovery events
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Device discovery abstraction
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// One-shot enumeration of currently attached devices
    async fn list_devices(&self) -> Result<Vec<TransportDeviceInfo>, TransportError>;

    /// Create a (closed) transport for a discovered device
    fn open_device(
        &self,
        device: &TransportDeviceInfo,
    ) -> Result<Arc<dyn Transport>, TransportError>;

    /// Start delivering attach/detach events.
    ///
    /// Only changes after this call are reported; enumerate separately for
    /// the initial set. Dropping the watch stops delivery.
    fn watch(&self) -> Result<HotplugWatch, TransportError>;
}

/// Live hot-plug subscription
pub struct HotplugWatch {
    events: broadcast::Receiver<DiscoveryEvent>,
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl HotplugWatch {
    /// Wrap an event receiver; `stop` runs when the watch is dropped
    pub fn new(
        events: broadcast::Receiver<DiscoveryEvent>,
        stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            stop: Some(Box::new(stop)),
        }
    }

    /// Wait for the next event; `None` once the source has gone away
    pub async fn recv(&mut self) -> Option<DiscoveryEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Hot-plug receiver lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for HotplugWatch {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

/// HID device discovery backed by hidapi
pub struct HidDiscovery {
    /// Only report interfaces on the FIDO usage page
    fido_only: bool,
    /// Hot-plug rescan interval
    poll_interval: Duration,
    /// Optional printer config for monitoring mode - wraps transports automatically
    printer_config: Option<PrinterConfig>,
}

impl Default for HidDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl HidDiscovery {
    /// Discover FIDO interfaces
    pub fn new() -> Self {
        Self {
            fido_only: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            printer_config: None,
        }
    }

    /// Discover every HID interface, FIDO or not
    pub fn all_interfaces() -> Self {
        Self {
            fido_only: false,
            ..Self::new()
        }
    }

    /// Set the hot-plug rescan interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// All transports opened via open_device() will be wrapped with a printer
    pub fn with_printer_config(mut self, config: PrinterConfig) -> Self {
        self.printer_config = Some(config);
        self
    }
}

/// Enumerate HID interfaces keyed by device path
fn enumerate(fido_only: bool) -> Result<BTreeMap<String, TransportDeviceInfo>, TransportError> {
    let api = HidApi::new()?;
    let mut devices = BTreeMap::new();

    for device_info in api.device_list() {
        let usage_page = device_info.usage_page();
        if fido_only && !device_registry::is_fido_interface(usage_page) {
            continue;
        }

        let path = device_info.path().to_string_lossy().to_string();
        let info = TransportDeviceInfo {
            vid: device_info.vendor_id(),
            pid: device_info.product_id(),
            device_path: path.clone(),
            serial: device_info
                .serial_number()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
            product_name: device_info.product_string().map(|s| s.to_string()),
            usage_page,
        };
        devices.insert(path, info);
    }

    Ok(devices)
}

/// Events turning `previous` into `current`, removals first
fn diff_devices(
    previous: &BTreeMap<String, TransportDeviceInfo>,
    current: &BTreeMap<String, TransportDeviceInfo>,
) -> Vec<DiscoveryEvent> {
    let removed = previous
        .iter()
        .filter(|(path, _)| !current.contains_key(*path))
        .map(|(_, info)| DiscoveryEvent::DeviceRemoved(info.clone()));
    let added = current
        .iter()
        .filter(|(path, _)| !previous.contains_key(*path))
        .map(|(_, info)| DiscoveryEvent::DeviceAdded(info.clone()));
    removed.chain(added).collect()
}

#[async_trait]
impl DeviceDiscovery for HidDiscovery {
    async fn list_devices(&self) -> Result<Vec<TransportDeviceInfo>, TransportError> {
        let devices: Vec<_> = enumerate(self.fido_only)?.into_values().collect();
        for device in &devices {
            debug!(
                "Found device: VID={:04X} PID={:04X} page={:04X} path={}",
                device.vid, device.pid, device.usage_page, device.device_path
            );
        }
        info!("Found {} devices", devices.len());
        Ok(devices)
    }

    fn open_device(
        &self,
        device: &TransportDeviceInfo,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = Arc::new(HidTransport::new(device.clone()));

        // Wrap with printer if monitoring is enabled
        let transport = match &self.printer_config {
            Some(config) => PrinterTransport::wrap(transport, config.clone()),
            None => transport,
        };
        Ok(transport)
    }

    fn watch(&self) -> Result<HotplugWatch, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Internal(format!("hot-plug watch needs a runtime: {e}")))?;

        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut known = enumerate(self.fido_only)?;
        let rescan = Arc::new(Notify::new());
        let udev_stop = start_udev_trigger(Arc::clone(&rescan));

        let fido_only = self.fido_only;
        let interval = self.poll_interval;
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rescan.notified() => {}
                }
                let current = match enumerate(fido_only) {
                    Ok(current) => current,
                    Err(e) => {
                        debug!("Hot-plug rescan failed: {}", e);
                        continue;
                    }
                };
                for event in diff_devices(&known, &current) {
                    debug!("Hot-plug: {:?}", event);
                    // No receivers just means nobody is watching right now
                    let _ = tx.send(event);
                }
                known = current;
            }
        });

        debug!("Hot-plug watch started ({:?} poll)", interval);
        Ok(HotplugWatch::new(rx, move || {
            task.abort();
            if let Some(flag) = udev_stop {
                flag.store(true, Ordering::SeqCst);
            }
            debug!("Hot-plug watch stopped");
        }))
    }
}

/// How often the udev thread checks its stop flag when idle
#[cfg(all(target_os = "linux", feature = "hotplug"))]
const UDEV_STOP_CHECK: Duration = Duration::from_millis(250);

/// Spawn a udev listener that triggers a rescan on hidraw add/remove.
///
/// Returns the stop flag, or `None` when udev isn't available (polling
/// alone still catches every change).
#[cfg(all(target_os = "linux", feature = "hotplug"))]
fn start_udev_trigger(rescan: Arc<Notify>) -> Option<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let spawned = std::thread::Builder::new()
        .name("udev-hidraw-monitor".into())
        .spawn(move || {
            if let Err(e) = run_udev_monitor(rescan, flag) {
                warn!("udev monitor unavailable, falling back to polling: {}", e);
            }
        });
    match spawned {
        Ok(_) => Some(stop),
        Err(e) => {
            warn!("Failed to spawn udev monitor thread: {}", e);
            None
        }
    }
}

#[cfg(all(target_os = "linux", feature = "hotplug"))]
fn run_udev_monitor(rescan: Arc<Notify>, stop: Arc<AtomicBool>) -> std::io::Result<()> {
    use futures::StreamExt;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let socket = tokio_udev::MonitorBuilder::new()?
            .match_subsystem("hidraw")?
            .listen()?;
        let mut events = tokio_udev::AsyncMonitorSocket::new(socket)?;

        while !stop.load(Ordering::Relaxed) {
            match tokio::time::timeout(UDEV_STOP_CHECK, events.next()).await {
                Ok(Some(Ok(event))) => {
                    debug!("udev hidraw event: {:?}", event.event_type());
                    rescan.notify_one();
                }
                Ok(Some(Err(e))) => warn!("udev monitor error: {}", e),
                Ok(None) => break,
                Err(_) => {}
            }
        }
        Ok(())
    })
}

#[cfg(not(all(target_os = "linux", feature = "hotplug")))]
fn start_udev_trigger(_rescan: Arc<Notify>) -> Option<Arc<AtomicBool>> {
    None
}
