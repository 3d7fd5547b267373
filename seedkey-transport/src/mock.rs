//! In-memory transports and discovery for tests
//!
//! `MockTransport` records every report sent and answers through a
//! responder closure; `simulated_key` builds a responder that speaks enough
//! CTAPHID (channel allocation plus reassembly) to drive a full seeding
//! exchange. `MockDiscovery` serves a scripted device list and lets tests
//! emit hot-plug events by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::device_registry::FIDO_USAGE_PAGE;
use crate::discovery::{DeviceDiscovery, HotplugWatch};
use crate::error::TransportError;
use crate::protocol::{self, capability, cmd, Channel, InitResponse, Message, MessageAssembler};
use crate::types::{DiscoveryEvent, Report, TransportDeviceInfo};
use crate::Transport;

/// Produces the reports the device sends back for one outbound report
pub type Responder = Box<dyn FnMut(&Report) -> Vec<Report> + Send>;

/// Builds an error for an injected failure
pub type ErrorFactory = Box<dyn Fn() -> TransportError + Send + Sync>;

/// Device info for a seedable key (STMicro VID/PID) with the given serial
pub fn seedable_device(serial: &str) -> TransportDeviceInfo {
    TransportDeviceInfo {
        vid: 0x0483,
        pid: 0xa2ca,
        device_path: format!("/dev/mock-hidraw-{serial}"),
        serial: Some(serial.to_string()),
        product_name: Some("Solo 4.1.5".to_string()),
        usage_page: FIDO_USAGE_PAGE,
    }
}

#[derive(Default)]
struct MockState {
    open: bool,
    sent: Vec<Report>,
    open_calls: usize,
    close_calls: usize,
    responder: Option<Responder>,
    open_error: Option<ErrorFactory>,
    send_error: Option<ErrorFactory>,
    close_error: Option<ErrorFactory>,
}

/// Transport that never touches hardware
pub struct MockTransport {
    info: TransportDeviceInfo,
    state: Mutex<MockState>,
    report_tx: broadcast::Sender<Report>,
}

impl MockTransport {
    pub fn new(info: TransportDeviceInfo) -> Self {
        let (report_tx, _) = broadcast::channel(256);
        Self {
            info,
            state: Mutex::new(MockState::default()),
            report_tx,
        }
    }

    /// Answer every sent report through `responder`
    pub fn with_responder(
        self,
        responder: impl FnMut(&Report) -> Vec<Report> + Send + 'static,
    ) -> Self {
        self.state.lock().responder = Some(Box::new(responder));
        self
    }

    /// Make every `open` fail
    pub fn fail_open(&self, error: impl Fn() -> TransportError + Send + Sync + 'static) {
        self.state.lock().open_error = Some(Box::new(error));
    }

    /// Make every `send_report` fail
    pub fn fail_send(&self, error: impl Fn() -> TransportError + Send + Sync + 'static) {
        self.state.lock().send_error = Some(Box::new(error));
    }

    /// Make every `close` fail (the device is still released)
    pub fn fail_close(&self, error: impl Fn() -> TransportError + Send + Sync + 'static) {
        self.state.lock().close_error = Some(Box::new(error));
    }

    /// Deliver a report as if the device had sent it unprompted
    pub fn inject(&self, report: Report) {
        let _ = self.report_tx.send(report);
    }

    /// Every report sent so far, in order
    pub fn sent(&self) -> Vec<Report> {
        self.state.lock().sent.clone()
    }

    pub fn open_calls(&self) -> usize {
        self.state.lock().open_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn device_info(&self) -> &TransportDeviceInfo {
        &self.info
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.open_calls += 1;
        if let Some(error) = &state.open_error {
            return Err(error());
        }
        state.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn send_report(&self, report: &Report) -> Result<(), TransportError> {
        let replies = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            if let Some(error) = &state.send_error {
                return Err(error());
            }
            state.sent.push(*report);
            match state.responder.as_mut() {
                Some(responder) => responder(report),
                None => Vec::new(),
            }
        };
        for reply in replies {
            let _ = self.report_tx.send(reply);
        }
        Ok(())
    }

    fn subscribe_reports(&self) -> Result<broadcast::Receiver<Report>, TransportError> {
        if !self.state.lock().open {
            return Err(TransportError::NotOpen);
        }
        Ok(self.report_tx.subscribe())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        let was_open = std::mem::replace(&mut state.open, false);
        if let Some(error) = &state.close_error {
            return Err(error());
        }
        if was_open {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }
}

/// INIT response a simulated key sends for `nonce`
pub fn init_response(nonce: &[u8], channel: Channel) -> InitResponse {
    let mut echoed = [0u8; protocol::INIT_NONCE_SIZE];
    let len = nonce.len().min(echoed.len());
    echoed[..len].copy_from_slice(&nonce[..len]);
    InitResponse {
        nonce: echoed,
        channel,
        protocol_version: 2,
        major_version: 4,
        minor_version: 1,
        build_version: 5,
        capabilities: capability::WINK | capability::CBOR,
    }
}

/// Responder for a key that allocates `channel` on INIT and hands every
/// other reassembled request to `handler`.
///
/// The handler returns `(command, payload)` replies, sent in order on the
/// request's channel. Frames the key can't reassemble are dropped.
pub fn simulated_key(
    channel: Channel,
    mut handler: impl FnMut(&Message) -> Vec<(u8, Vec<u8>)> + Send + 'static,
) -> Responder {
    let mut assembler = MessageAssembler::new();
    Box::new(move |report: &Report| {
        let frame = protocol::decode(report);
        let message = match assembler.push(&frame) {
            Ok(Some(message)) => message,
            _ => return Vec::new(),
        };

        if message.command == cmd::INIT {
            let body = init_response(&message.payload, channel).to_bytes();
            return protocol::encode(message.channel, cmd::INIT, &body).unwrap_or_default();
        }

        handler(&message)
            .into_iter()
            .flat_map(|(command, payload)| {
                protocol::encode(message.channel, command, &payload).unwrap_or_default()
            })
            .collect()
    })
}

#[derive(Default)]
struct DiscoveryState {
    devices: Vec<TransportDeviceInfo>,
    transports: HashMap<String, Arc<MockTransport>>,
    list_error: Option<ErrorFactory>,
    watch_error: Option<ErrorFactory>,
    /// Delay between taking the listing and returning it
    list_delay: Option<Duration>,
    list_calls: usize,
    watch_calls: usize,
}

/// Discovery over a scripted device list
pub struct MockDiscovery {
    state: Mutex<DiscoveryState>,
    events: broadcast::Sender<DiscoveryEvent>,
    active_watches: Arc<AtomicUsize>,
}

impl Default for MockDiscovery {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MockDiscovery {
    pub fn new(devices: Vec<TransportDeviceInfo>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(DiscoveryState {
                devices,
                ..Default::default()
            }),
            events,
            active_watches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serve `transport` from `open_device` for its device path
    pub fn add_transport(&self, transport: Arc<MockTransport>) {
        let path = transport.device_info().device_path.clone();
        self.state.lock().transports.insert(path, transport);
    }

    /// Make every enumeration fail
    pub fn fail_listing(&self, error: impl Fn() -> TransportError + Send + Sync + 'static) {
        self.state.lock().list_error = Some(Box::new(error));
    }

    /// Make every hot-plug watch fail to start
    pub fn fail_watch(&self, error: impl Fn() -> TransportError + Send + Sync + 'static) {
        self.state.lock().watch_error = Some(Box::new(error));
    }

    /// Return listings only after `delay`, as taken when the call started
    pub fn delay_listing(&self, delay: Duration) {
        self.state.lock().list_delay = Some(delay);
    }

    /// Update the device list and notify watchers
    pub fn emit(&self, event: DiscoveryEvent) {
        {
            let mut state = self.state.lock();
            match &event {
                DiscoveryEvent::DeviceAdded(info) => state.devices.push(info.clone()),
                DiscoveryEvent::DeviceRemoved(info) => {
                    state.devices.retain(|d| d.device_path != info.device_path)
                }
            }
        }
        let _ = self.events.send(event);
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn watch_calls(&self) -> usize {
        self.state.lock().watch_calls
    }

    /// Watches started and not yet dropped
    pub fn active_watches(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceDiscovery for MockDiscovery {
    async fn list_devices(&self) -> Result<Vec<TransportDeviceInfo>, TransportError> {
        let (devices, delay) = {
            let mut state = self.state.lock();
            state.list_calls += 1;
            if let Some(error) = &state.list_error {
                return Err(error());
            }
            (state.devices.clone(), state.list_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(devices)
    }

    fn open_device(
        &self,
        device: &TransportDeviceInfo,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.state
            .lock()
            .transports
            .get(&device.device_path)
            .map(|t| Arc::clone(t) as Arc<dyn Transport>)
            .ok_or_else(|| TransportError::DeviceNotFound(device.device_path.clone()))
    }

    fn watch(&self) -> Result<HotplugWatch, TransportError> {
        {
            let mut state = self.state.lock();
            state.watch_calls += 1;
            if let Some(error) = &state.watch_error {
                return Err(error());
            }
        }
        self.active_watches.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active_watches);
        Ok(HotplugWatch::new(self.events.subscribe(), move || {
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}
