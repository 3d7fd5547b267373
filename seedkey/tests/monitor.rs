//! Device monitor behaviour over scripted discovery

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use seedkey::{DeviceKeyKind, DeviceMonitor, MonitorSubscription, TransportDeviceInfo};
use seedkey_transport::mock::{seedable_device, MockDiscovery};
use seedkey_transport::{DiscoveryEvent, TransportError};
use tokio::sync::mpsc;

type Updates = mpsc::UnboundedReceiver<Vec<String>>;

fn serials(devices: &[TransportDeviceInfo]) -> Vec<String> {
    devices
        .iter()
        .map(|d| d.serial.clone().unwrap_or_default())
        .collect()
}

fn subscribe(monitor: &DeviceMonitor) -> (MonitorSubscription, Updates) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = monitor.start_monitoring(
        move |devices| {
            let _ = tx.send(serials(devices));
        },
        |_| {},
    );
    (subscription, rx)
}

async fn next(updates: &mut Updates) -> Vec<String> {
    tokio::time::timeout(Duration::from_secs(1), updates.recv())
        .await
        .expect("no update within 1s")
        .expect("update channel closed")
}

fn keyboard() -> TransportDeviceInfo {
    TransportDeviceInfo {
        vid: 0x3151,
        pid: 0x5030,
        device_path: "/dev/mock-keyboard".into(),
        serial: Some("kbd".into()),
        product_name: Some("Keyboard".into()),
        usage_page: 0xFF00,
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_enumerate_then_detach() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    let monitor = DeviceMonitor::new(discovery.clone());

    let (_subscription, mut updates) = subscribe(&monitor);

    assert_eq!(next(&mut updates).await, vec!["A"]);
    discovery.emit(DiscoveryEvent::DeviceRemoved(seedable_device("A")));
    assert_eq!(next(&mut updates).await, Vec::<String>::new());
    assert!(monitor.devices().is_empty());
}

#[tokio::test]
async fn test_attach_keeps_set_sorted() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("C")]));
    let monitor = DeviceMonitor::new(discovery.clone());
    let (_subscription, mut updates) = subscribe(&monitor);
    assert_eq!(next(&mut updates).await, vec!["C"]);

    discovery.emit(DiscoveryEvent::DeviceAdded(seedable_device("A")));
    assert_eq!(next(&mut updates).await, vec!["A", "C"]);

    discovery.emit(DiscoveryEvent::DeviceAdded(seedable_device("B")));
    assert_eq!(next(&mut updates).await, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_ineligible_devices_are_ignored() {
    let discovery = Arc::new(MockDiscovery::new(vec![keyboard(), seedable_device("A")]));
    let monitor = DeviceMonitor::new(discovery.clone());
    let (_subscription, mut updates) = subscribe(&monitor);
    assert_eq!(next(&mut updates).await, vec!["A"]);

    discovery.emit(DiscoveryEvent::DeviceRemoved(keyboard()));
    discovery.emit(DiscoveryEvent::DeviceAdded(seedable_device("B")));
    // The keyboard event produced no notification of its own
    assert_eq!(next(&mut updates).await, vec!["A", "B"]);
}

#[tokio::test]
async fn test_late_subscriber_gets_replay_without_enumeration() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    let monitor = DeviceMonitor::new(discovery.clone());

    let (_first, mut first_updates) = subscribe(&monitor);
    assert_eq!(next(&mut first_updates).await, vec!["A"]);

    let (_second, mut second_updates) = subscribe(&monitor);
    // Replay is delivered synchronously during subscription
    assert_eq!(second_updates.try_recv().unwrap(), vec!["A"]);
    assert_eq!(discovery.list_calls(), 1);
    assert_eq!(discovery.watch_calls(), 1);

    discovery.emit(DiscoveryEvent::DeviceAdded(seedable_device("B")));
    assert_eq!(next(&mut first_updates).await, vec!["A", "B"]);
    assert_eq!(next(&mut second_updates).await, vec!["A", "B"]);
}

#[tokio::test]
async fn test_late_subscriber_to_empty_set_gets_no_replay() {
    let discovery = Arc::new(MockDiscovery::new(vec![]));
    let monitor = DeviceMonitor::new(discovery.clone());

    let (_first, mut first_updates) = subscribe(&monitor);
    assert!(next(&mut first_updates).await.is_empty());

    let (_second, mut second_updates) = subscribe(&monitor);
    assert!(second_updates.try_recv().is_err());
}

#[tokio::test]
async fn test_stop_removes_only_that_subscriber() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    let monitor = DeviceMonitor::new(discovery.clone());

    let (first, mut first_updates) = subscribe(&monitor);
    let (_second, mut second_updates) = subscribe(&monitor);
    assert_eq!(next(&mut first_updates).await, vec!["A"]);
    assert_eq!(next(&mut second_updates).await, vec!["A"]);

    first.stop();
    assert_eq!(monitor.subscriber_count(), 1);
    assert!(monitor.is_active());
    assert_eq!(discovery.active_watches(), 1);

    discovery.emit(DiscoveryEvent::DeviceAdded(seedable_device("B")));
    assert_eq!(next(&mut second_updates).await, vec!["A", "B"]);
    assert!(first_updates.try_recv().is_err());
}

#[tokio::test]
async fn test_last_subscriber_tears_down() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    let monitor = DeviceMonitor::new(discovery.clone());

    let (subscription, mut updates) = subscribe(&monitor);
    assert_eq!(next(&mut updates).await, vec!["A"]);
    assert_eq!(discovery.active_watches(), 1);

    drop(subscription);
    assert!(!monitor.is_active());
    assert!(monitor.devices().is_empty());
    assert!(eventually(|| discovery.active_watches() == 0).await);

    // Monitoring restarts from scratch for the next subscriber
    let (_again, mut updates) = subscribe(&monitor);
    assert_eq!(next(&mut updates).await, vec!["A"]);
    assert_eq!(discovery.list_calls(), 2);
    assert_eq!(discovery.watch_calls(), 2);
}

#[tokio::test]
async fn test_enumeration_error_goes_to_triggering_subscriber() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    discovery.fail_listing(|| TransportError::HidPermissionDenied("/dev/hidraw0".into()));
    let monitor = DeviceMonitor::new(discovery.clone());

    let (error_tx, mut errors) = mpsc::unbounded_channel();
    let _subscription = monitor.start_monitoring(
        |_| {},
        move |e| {
            let _ = error_tx.send(e.is_permission_denied());
        },
    );

    let permission_denied = tokio::time::timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(permission_denied);
    assert!(monitor.requires_permission());
    assert!(monitor
        .enumeration_error()
        .is_some_and(|msg| msg.contains("permission denied")));

    // Monitoring keeps running; hot-plug events still arrive
    let (_second, mut updates) = subscribe(&monitor);
    discovery.emit(DiscoveryEvent::DeviceAdded(seedable_device("B")));
    assert_eq!(next(&mut updates).await, vec!["B"]);
}

#[tokio::test]
async fn test_refresh_after_permission_granted() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    discovery.fail_listing(|| TransportError::HidPermissionDenied("/dev/hidraw0".into()));
    let monitor = DeviceMonitor::new(discovery.clone());
    assert!(monitor.requires_permission());

    assert!(monitor.refresh().await.is_err());
    assert!(monitor.requires_permission());

    let fresh = Arc::new(MockDiscovery::new(vec![seedable_device("A"), keyboard()]));
    let monitor = DeviceMonitor::new(fresh.clone());
    let (_subscription, mut updates) = subscribe(&monitor);
    assert_eq!(next(&mut updates).await, vec!["A"]);

    let found = monitor.refresh().await.unwrap();
    assert_eq!(serials(&found), vec!["A"]);
    assert!(!monitor.requires_permission());
    assert!(monitor.enumeration_error().is_none());
}

#[tokio::test]
async fn test_product_name_identity_collapses_same_model() {
    let mut second = seedable_device("B");
    second.device_path = "/dev/mock-other".into();
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A"), second]));
    let monitor = DeviceMonitor::with_key_kind(discovery.clone(), DeviceKeyKind::ProductName);

    let (_subscription, mut updates) = subscribe(&monitor);
    // Same VID/PID/product name: one identity
    assert_eq!(next(&mut updates).await.len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_from_inside_callback() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    let monitor = DeviceMonitor::new(discovery.clone());

    let slot: Arc<Mutex<Option<MonitorSubscription>>> = Arc::new(Mutex::new(None));
    let (tx, mut calls) = mpsc::unbounded_channel();
    let inner = Arc::clone(&slot);
    let subscription = monitor.start_monitoring(
        move |_| {
            let _ = tx.send(());
            // Leaving during notification must not deadlock
            if let Some(subscription) = inner.lock().take() {
                subscription.stop();
            }
        },
        |_| {},
    );
    *slot.lock() = Some(subscription);

    tokio::time::timeout(Duration::from_secs(1), calls.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(eventually(|| monitor.subscriber_count() == 0).await);
    assert!(!monitor.is_active());

    discovery.emit(DiscoveryEvent::DeviceAdded(seedable_device("B")));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(calls.try_recv().is_err());
}

#[tokio::test]
async fn test_subscribe_from_inside_callback() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    let monitor = DeviceMonitor::new(discovery.clone());

    let nested: Arc<Mutex<Vec<MonitorSubscription>>> = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut nested_updates) = mpsc::unbounded_channel();
    let handle = monitor.clone();
    let holder = Arc::clone(&nested);
    let _subscription = monitor.start_monitoring(
        move |_| {
            if holder.lock().is_empty() {
                let tx = tx.clone();
                let inner = handle.start_monitoring(
                    move |devices| {
                        let _ = tx.send(serials(devices));
                    },
                    |_| {},
                );
                holder.lock().push(inner);
            }
        },
        |_| {},
    );

    // The nested subscriber joins a running monitor and gets the replay
    assert_eq!(next(&mut nested_updates).await, vec!["A"]);
    assert_eq!(monitor.subscriber_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joining_during_attach_ends_on_current_set() {
    for _ in 0..50 {
        let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
        let monitor = DeviceMonitor::new(discovery.clone());
        let (_first, mut first_updates) = subscribe(&monitor);
        assert_eq!(next(&mut first_updates).await, vec!["A"]);

        let emitter = {
            let discovery = Arc::clone(&discovery);
            tokio::spawn(async move {
                discovery.emit(DiscoveryEvent::DeviceAdded(seedable_device("B")));
            })
        };

        let last_seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&last_seen);
        let _second = monitor.start_monitoring(
            move |devices| {
                *sink.lock() = serials(devices);
            },
            |_| {},
        );

        emitter.await.unwrap();
        assert_eq!(next(&mut first_updates).await, vec!["A", "B"]);
        assert!(
            eventually(|| *last_seen.lock() == vec!["A", "B"]).await,
            "late subscriber stuck on {:?}",
            last_seen.lock()
        );
        assert_eq!(serials(&monitor.devices()), vec!["A", "B"]);
    }
}

#[tokio::test]
async fn test_watch_failure_keeps_enumeration_error_for_subscriber() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    discovery.fail_watch(|| TransportError::Internal("udev unavailable".into()));
    discovery.fail_listing(|| TransportError::HidPermissionDenied("/dev/hidraw0".into()));
    let monitor = DeviceMonitor::new(discovery.clone());

    let (error_tx, mut errors) = mpsc::unbounded_channel();
    let _subscription = monitor.start_monitoring(
        |_| {},
        move |e| {
            let _ = error_tx.send(e.is_permission_denied());
        },
    );

    let permission_denied = tokio::time::timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(permission_denied);

    // No hot-plug source: monitoring stops and the next subscriber restarts it
    assert!(eventually(|| !monitor.is_active()).await);
    assert_eq!(monitor.subscriber_count(), 1);
    let _again = monitor.start_monitoring(|_| {}, |_| {});
    assert!(eventually(|| discovery.watch_calls() == 2).await);
    assert!(eventually(|| discovery.list_calls() == 2).await);
}

#[tokio::test]
async fn test_watch_failure_still_delivers_enumeration() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    discovery.fail_watch(|| TransportError::Internal("udev unavailable".into()));
    let monitor = DeviceMonitor::new(discovery.clone());

    let (error_tx, mut errors) = mpsc::unbounded_channel();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let _subscription = monitor.start_monitoring(
        move |devices| {
            let _ = tx.send(serials(devices));
        },
        move |e| {
            let _ = error_tx.send(e.to_string());
        },
    );

    assert_eq!(next(&mut updates).await, vec!["A"]);
    assert!(eventually(|| !monitor.is_active()).await);
    assert!(errors.try_recv().is_err());
    assert!(!monitor.requires_permission());
}

#[tokio::test]
async fn test_refresh_overtaken_by_detach_is_not_merged() {
    let discovery = Arc::new(MockDiscovery::new(vec![seedable_device("A")]));
    let monitor = DeviceMonitor::new(discovery.clone());
    let (_subscription, mut updates) = subscribe(&monitor);
    assert_eq!(next(&mut updates).await, vec!["A"]);

    discovery.delay_listing(Duration::from_millis(100));
    let refresh = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    discovery.emit(DiscoveryEvent::DeviceRemoved(seedable_device("A")));
    assert_eq!(next(&mut updates).await, Vec::<String>::new());

    // The listing predates the detach; it is returned but not merged
    let found = refresh.await.unwrap().unwrap();
    assert_eq!(serials(&found), vec!["A"]);
    assert!(monitor.devices().is_empty());
    assert!(updates.try_recv().is_err());
}
