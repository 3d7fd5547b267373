//! Tracks which seedable keys are attached
//!
//! A `DeviceMonitor` keeps the eligible device set keyed by identity key and
//! fans every change out to its subscribers. Monitoring only runs while
//! someone is subscribed: the first subscriber starts the hot-plug watch and
//! the initial enumeration, the last one to leave tears both down and
//! clears the set.
//!
//! Hot-plug events come from a single pump task. Every change and every
//! replay is delivered under one reentrant delivery lock, so a subscriber's
//! last notification is always the current set. Callbacks run without the
//! state lock held and may subscribe or unsubscribe from inside.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use seedkey_transport::{
    is_eligible, DeviceDiscovery, DeviceKeyKind, DiscoveryEvent, TransportDeviceInfo,
    TransportError,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ChangeListener = Arc<dyn Fn(&[TransportDeviceInfo]) + Send + Sync>;
type ErrorCallback = Box<dyn FnOnce(&TransportError) + Send>;

#[derive(Default)]
struct MonitorState {
    /// Eligible devices by identity key (sorted)
    devices: BTreeMap<String, TransportDeviceInfo>,
    listeners: Vec<(u64, ChangeListener)>,
    /// Monitoring is running (or being started)
    active: bool,
    /// Bumped on every start so a stale pump can't touch a newer session
    generation: u64,
    pump: Option<JoinHandle<()>>,
    has_enumerated: bool,
    enumeration_error: Option<String>,
    /// Hot-plug changes applied so far
    events: u64,
}

impl MonitorState {
    fn snapshot(&self) -> Vec<TransportDeviceInfo> {
        self.devices.values().cloned().collect()
    }

    fn listeners(&self) -> Vec<ChangeListener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active && self.generation == generation
    }
}

struct MonitorShared {
    discovery: Arc<dyn DeviceDiscovery>,
    key_kind: DeviceKeyKind,
    state: Mutex<MonitorState>,
    /// Held from snapshot to end of delivery; lock order is delivery, then state
    delivery: ReentrantMutex<()>,
    next_id: AtomicU64,
}

impl MonitorShared {
    /// Generation and event count to tag an enumeration started now
    fn position(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.generation, state.events)
    }

    /// Record an enumeration and, if `generation` is still monitoring and no
    /// hot-plug change landed since `events`, merge its eligible devices into
    /// the set. Returns the eligible devices found.
    fn apply_enumeration(
        &self,
        (generation, events): (u64, u64),
        result: Result<Vec<TransportDeviceInfo>, TransportError>,
    ) -> Result<Vec<TransportDeviceInfo>, TransportError> {
        let _delivery = self.delivery.lock();
        let mut state = self.state.lock();
        let found: Vec<_> = match result {
            Ok(found) => found.into_iter().filter(is_eligible).collect(),
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                state.enumeration_error = Some(e.to_string());
                return Err(e);
            }
        };

        state.has_enumerated = true;
        state.enumeration_error = None;
        if !state.is_current(generation) {
            return Ok(found);
        }
        if state.events != events {
            debug!("Enumeration overtaken by hot-plug events, not merged");
            return Ok(found);
        }

        for device in &found {
            state
                .devices
                .insert(device.identity_key(self.key_kind), device.clone());
        }
        info!("Enumerated {} seedable keys", state.devices.len());

        let (devices, listeners) = (state.snapshot(), state.listeners());
        drop(state);
        notify(&listeners, &devices);
        Ok(found)
    }

    fn apply_event(&self, generation: u64, event: DiscoveryEvent) {
        let _delivery = self.delivery.lock();
        let mut state = self.state.lock();
        if !state.is_current(generation) {
            return;
        }

        match event {
            DiscoveryEvent::DeviceAdded(device) if is_eligible(&device) => {
                debug!("Attached: {}", device.display_name());
                state
                    .devices
                    .insert(device.identity_key(self.key_kind), device);
            }
            DiscoveryEvent::DeviceRemoved(device) if is_eligible(&device) => {
                debug!("Detached: {}", device.display_name());
                state.devices.remove(&device.identity_key(self.key_kind));
            }
            _ => return,
        }
        state.events += 1;

        let (devices, listeners) = (state.snapshot(), state.listeners());
        drop(state);
        notify(&listeners, &devices);
    }

    fn remove_listener(&self, id: u64) {
        let pump = {
            let mut state = self.state.lock();
            state.listeners.retain(|(listener_id, _)| *listener_id != id);
            if !state.listeners.is_empty() || !state.active {
                return;
            }
            state.active = false;
            state.devices.clear();
            state.pump.take()
        };

        // Dropping the pump's future drops its hot-plug watch
        if let Some(pump) = pump {
            pump.abort();
        }
        debug!("Last subscriber left, device monitoring stopped");
    }

    /// The pump for `generation` exited on its own
    fn pump_finished(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.is_current(generation) {
            state.active = false;
            state.pump = None;
        }
    }
}

fn notify(listeners: &[ChangeListener], devices: &[TransportDeviceInfo]) {
    for listener in listeners {
        listener(devices);
    }
}

/// Initial enumeration followed by hot-plug events, until aborted.
///
/// Without a hot-plug source monitoring ends after the enumeration, and the
/// next subscriber starts it again.
async fn run_pump(
    shared: Weak<MonitorShared>,
    discovery: Arc<dyn DeviceDiscovery>,
    generation: u64,
    on_error: ErrorCallback,
) {
    // Watch first so nothing attached during enumeration is missed
    let watch = discovery.watch();
    if let Err(e) = &watch {
        warn!("Hot-plug watch unavailable: {}", e);
    }

    let Some(monitor) = shared.upgrade() else {
        return;
    };
    let (_, events) = monitor.position();
    drop(monitor);

    let result = discovery.list_devices().await;
    let Some(monitor) = shared.upgrade() else {
        return;
    };
    if let Err(e) = monitor.apply_enumeration((generation, events), result) {
        on_error(&e);
    }

    let mut watch = match watch {
        Ok(watch) => watch,
        Err(_) => {
            monitor.pump_finished(generation);
            return;
        }
    };
    drop(monitor);

    while let Some(event) = watch.recv().await {
        let Some(monitor) = shared.upgrade() else {
            return;
        };
        monitor.apply_event(generation, event);
    }
    debug!("Hot-plug event source closed");
    if let Some(monitor) = shared.upgrade() {
        monitor.pump_finished(generation);
    }
}

/// What a new subscriber has to do
enum Join {
    /// First subscriber: start monitoring for this generation
    Start(u64),
    /// Monitor already running: replay the current set
    Replay(Vec<TransportDeviceInfo>),
}

/// Shared handle to the eligible device set
#[derive(Clone)]
pub struct DeviceMonitor {
    shared: Arc<MonitorShared>,
}

impl DeviceMonitor {
    /// Monitor keys found through `discovery`, deduplicated by serial number
    pub fn new(discovery: Arc<dyn DeviceDiscovery>) -> Self {
        Self::with_key_kind(discovery, DeviceKeyKind::default())
    }

    pub fn with_key_kind(discovery: Arc<dyn DeviceDiscovery>, key_kind: DeviceKeyKind) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                discovery,
                key_kind,
                state: Mutex::new(MonitorState::default()),
                delivery: ReentrantMutex::new(()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to the eligible device set.
    ///
    /// `on_change` receives the full set, sorted by identity key, after every
    /// change. A subscriber joining a running monitor gets the current set
    /// right away if it's non-empty. `on_error` is called at most once, with
    /// the initial enumeration's error, and only for the subscriber that
    /// started monitoring. A failing hot-plug watch is only logged.
    ///
    /// Must be called within a tokio runtime.
    pub fn start_monitoring(
        &self,
        on_change: impl Fn(&[TransportDeviceInfo]) + Send + Sync + 'static,
        on_error: impl FnOnce(&TransportError) + Send + 'static,
    ) -> MonitorSubscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: ChangeListener = Arc::new(on_change);

        // Registration and replay happen under the delivery lock so no
        // newer notification can reach this listener before the replay
        let delivery = self.shared.delivery.lock();
        let join = {
            let mut state = self.shared.state.lock();
            state.listeners.push((id, Arc::clone(&listener)));
            if state.active {
                Join::Replay(state.snapshot())
            } else {
                state.active = true;
                state.generation += 1;
                state.devices.clear();
                Join::Start(state.generation)
            }
        };

        let subscription = MonitorSubscription {
            shared: Arc::clone(&self.shared),
            id,
            stopped: false,
        };

        match join {
            Join::Start(generation) => self.start_pump(generation, Box::new(on_error)),
            Join::Replay(devices) if !devices.is_empty() => listener(&devices),
            Join::Replay(_) => {}
        }
        drop(delivery);
        subscription
    }

    fn start_pump(&self, generation: u64, on_error: ErrorCallback) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                let mut state = self.shared.state.lock();
                if state.is_current(generation) {
                    state.active = false;
                }
                drop(state);
                on_error(&TransportError::Internal(format!(
                    "device monitoring needs a runtime: {e}"
                )));
                return;
            }
        };

        debug!("Starting device monitoring");
        let pump = runtime.spawn(run_pump(
            Arc::downgrade(&self.shared),
            Arc::clone(&self.shared.discovery),
            generation,
            on_error,
        ));

        let mut state = self.shared.state.lock();
        if state.is_current(generation) {
            state.pump = Some(pump);
        } else {
            // Everyone left before the pump was registered
            pump.abort();
        }
    }

    /// Current eligible devices, sorted by identity key
    pub fn devices(&self) -> Vec<TransportDeviceInfo> {
        self.shared.state.lock().snapshot()
    }

    /// True until an enumeration has succeeded at least once
    pub fn requires_permission(&self) -> bool {
        !self.shared.state.lock().has_enumerated
    }

    /// Message of the most recent failed enumeration, cleared on success
    pub fn enumeration_error(&self) -> Option<String> {
        self.shared.state.lock().enumeration_error.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().active
    }

    /// Enumerate now (e.g. after the user granted access).
    ///
    /// While monitoring, the result is merged into the set and subscribers
    /// are notified, unless a hot-plug change was applied while it ran.
    /// Returns the eligible devices found.
    pub async fn refresh(&self) -> Result<Vec<TransportDeviceInfo>, TransportError> {
        let position = self.shared.position();
        let result = self.shared.discovery.list_devices().await;
        self.shared.apply_enumeration(position, result)
    }
}

/// Active subscription to a [`DeviceMonitor`]; dropping it unsubscribes
pub struct MonitorSubscription {
    shared: Arc<MonitorShared>,
    id: u64,
    stopped: bool,
}

impl MonitorSubscription {
    /// Stop receiving notifications
    pub fn stop(mut self) {
        self.unsubscribe();
    }

    fn unsubscribe(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.shared.remove_listener(self.id);
        }
    }
}

impl Drop for MonitorSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
