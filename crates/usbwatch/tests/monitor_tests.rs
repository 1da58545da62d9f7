//! Monitor worker integration tests
//!
//! Drive the worker through the async handle with a scripted mock
//! driver, in both polling and event-driven modes.

use std::time::Duration;
use usbwatch::driver::BusEvent;
use usbwatch::test_utils::{DEFAULT_TEST_TIMEOUT, MockDriver, identity, with_timeout};
use usbwatch::{MonitorConfig, PresenceEvent, spawn_monitor};

fn fast_polling_config() -> MonitorConfig {
    MonitorConfig {
        poll_interval: Duration::from_millis(10),
        ..MonitorConfig::default()
    }
}

#[tokio::test]
async fn test_polling_mode_detects_insertion_and_removal() {
    let driver = MockDriver::new(false);
    let devices = driver.devices();
    let (handle, join) = spawn_monitor(driver, fast_polling_config()).unwrap();

    let dev = identity(0x0483, 0x3748);
    assert!(!handle.is_present(dev).await.unwrap());

    devices.lock().unwrap().push(dev);
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, handle.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, PresenceEvent::Inserted(vec![dev]));
    assert!(handle.is_present(dev).await.unwrap());
    assert_eq!(handle.list_devices().await.unwrap(), vec![dev]);

    devices.lock().unwrap().clear();
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, handle.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, PresenceEvent::Removed(vec![dev]));
    assert!(!handle.is_present(dev).await.unwrap());

    handle.shutdown().await.unwrap();
    join.join().unwrap();
}

#[tokio::test]
async fn test_devices_attached_at_startup_are_not_insertions() {
    let driver = MockDriver::new(false);
    let dev = identity(0x1234, 0x5678);
    driver.devices().lock().unwrap().push(dev);

    let (handle, join) = spawn_monitor(driver, fast_polling_config()).unwrap();

    // Seeded silently: visible in queries, no notification
    assert!(handle.is_present(dev).await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.try_recv_event().is_none());

    handle.shutdown().await.unwrap();
    join.join().unwrap();
}

#[tokio::test]
async fn test_event_mode_tracks_arrivals_and_departures() {
    let driver = MockDriver::new(true);
    let events = driver.bus_events();
    let opened = driver.opened();
    let live = driver.live_handles();
    let (handle, join) = spawn_monitor(driver, MonitorConfig::default()).unwrap();

    let dev = identity(0x0483, 0x3748);
    events.lock().unwrap().push_back(BusEvent::Arrived(dev));
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, handle.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, PresenceEvent::Inserted(vec![dev]));

    // Arrival opened a handle and keeps it for the device's lifetime
    assert_eq!(*opened.lock().unwrap(), vec![dev]);
    assert_eq!(live.load(std::sync::atomic::Ordering::Acquire), 1);

    events.lock().unwrap().push_back(BusEvent::Departed(dev));
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, handle.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, PresenceEvent::Removed(vec![dev]));
    assert!(!handle.is_present(dev).await.unwrap());
    assert_eq!(live.load(std::sync::atomic::Ordering::Acquire), 0);

    handle.shutdown().await.unwrap();
    join.join().unwrap();
}

#[tokio::test]
async fn test_event_mode_open_failure_suppresses_notification() {
    let driver = MockDriver::new(true);
    let events = driver.bus_events();
    let opened = driver.opened();
    let broken = identity(0xdead, 0xbeef);
    let good = identity(0x0483, 0x3748);
    driver.fail_open().lock().unwrap().insert(broken);

    let (handle, join) = spawn_monitor(driver, MonitorConfig::default()).unwrap();

    events.lock().unwrap().push_back(BusEvent::Arrived(broken));
    events.lock().unwrap().push_back(BusEvent::Arrived(good));

    // Only the openable device surfaces
    let event = with_timeout(DEFAULT_TEST_TIMEOUT, handle.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, PresenceEvent::Inserted(vec![good]));
    assert!(!handle.is_present(broken).await.unwrap());
    assert_eq!(*opened.lock().unwrap(), vec![good]);

    handle.shutdown().await.unwrap();
    join.join().unwrap();
}

#[tokio::test]
async fn test_watch_list_commands() {
    let first = identity(0x1111, 0x0001);
    let second = identity(0x2222, 0x0002);

    let (handle, join) = spawn_monitor(
        MockDriver::new(false),
        MonitorConfig {
            watch: vec![first],
            ..fast_polling_config()
        },
    )
    .unwrap();

    // Duplicate watch is rejected, a new one accepted
    assert!(!handle.add_watch(first).await.unwrap());
    assert!(handle.add_watch(second).await.unwrap());
    assert_eq!(
        handle.absent_watched().await.unwrap(),
        vec![first, second]
    );

    // Removal works on the head of the list too
    assert!(handle.remove_watch(first).await.unwrap());
    assert_eq!(handle.absent_watched().await.unwrap(), vec![second]);
    // Removing an identity never watched still succeeds
    assert!(handle.remove_watch(first).await.unwrap());

    handle.shutdown().await.unwrap();
    join.join().unwrap();
}

#[tokio::test]
async fn test_absent_watched_reflects_snapshot() {
    let driver = MockDriver::new(false);
    let devices = driver.devices();
    let watched = identity(0x0483, 0x3748);

    let (handle, join) = spawn_monitor(
        driver,
        MonitorConfig {
            watch: vec![watched],
            ..fast_polling_config()
        },
    )
    .unwrap();

    assert_eq!(handle.absent_watched().await.unwrap(), vec![watched]);

    devices.lock().unwrap().push(watched);
    let _ = with_timeout(DEFAULT_TEST_TIMEOUT, handle.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert!(handle.absent_watched().await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
    join.join().unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_the_worker() {
    let (handle, join) = spawn_monitor(MockDriver::new(true), MonitorConfig::default()).unwrap();

    handle.shutdown().await.unwrap();
    join.join().unwrap();

    // Worker gone: subsequent commands fail instead of hanging
    assert!(handle.is_present(identity(1, 1)).await.is_err());
}
