//! Test utilities
//!
//! Mock driver and endpoint implementations with scripted behavior,
//! plus async test helpers. The mocks keep their state behind `Arc`s
//! so tests can hold inspection handles after the mock itself has
//! moved into a worker or channel.

use crate::driver::{BulkEndpoints, BusEvent, HostDriver};
use crate::error::{Error, Result};
use crate::types::{DeviceConfig, DeviceIdentity, Direction, EndpointPair};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Shorthand for a vid/pid identity.
pub fn identity(vendor_id: u16, product_id: u16) -> DeviceIdentity {
    DeviceIdentity::new(vendor_id, product_id)
}

/// One scripted outcome of a poll-tick read attempt.
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// The device delivered these bytes.
    Data(Vec<u8>),
    /// The device had nothing pending.
    Empty,
    /// The read attempt failed.
    Failure,
}

/// Mock bulk endpoint pair with a scripted read sequence and a write
/// log.
pub struct MockEndpoints {
    reads: Arc<Mutex<VecDeque<ReadStep>>>,
    written: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
    busy: Option<Arc<AtomicBool>>,
}

impl MockEndpoints {
    /// Endpoints whose reads always come back empty.
    pub fn idle() -> Self {
        Self::scripted(Vec::new())
    }

    /// Endpoints that play back `steps` one per read attempt, then
    /// report "no data pending" forever.
    pub fn scripted(steps: Vec<ReadStep>) -> Self {
        Self {
            reads: Arc::new(Mutex::new(steps.into())),
            written: Arc::new(Mutex::new(Vec::new())),
            fail_writes: Arc::new(AtomicBool::new(false)),
            busy: None,
        }
    }

    fn exclusive(busy: Arc<AtomicBool>) -> Self {
        let mut endpoints = Self::idle();
        endpoints.busy = Some(busy);
        endpoints
    }

    /// Handle onto the remaining read script; usable after the mock
    /// has moved into a channel.
    pub fn script(&self) -> Arc<Mutex<VecDeque<ReadStep>>> {
        self.reads.clone()
    }

    /// Handle onto the write log.
    pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        self.written.clone()
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }
}

impl BulkEndpoints for MockEndpoints {
    fn try_read(&self, buf: &mut [u8]) -> Result<usize> {
        let step = self.reads.lock().unwrap().pop_front();
        match step {
            None | Some(ReadStep::Empty) => Ok(0),
            Some(ReadStep::Data(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(ReadStep::Failure) => Err(Error::Transfer("injected read failure".to_string())),
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(Error::Transfer("injected write failure".to_string()));
        }
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }
}

impl Drop for MockEndpoints {
    fn drop(&mut self) {
        if let Some(busy) = &self.busy {
            busy.store(false, Ordering::Release);
        }
    }
}

/// Raw device handle handed out by [`MockDriver::open_device`].
/// Decrements the live-handle count on drop.
pub struct MockDeviceHandle {
    live: Arc<AtomicUsize>,
}

impl Drop for MockDeviceHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Scriptable driver collaborator.
///
/// The system device list and the bus-event queue are plain shared
/// state; tests mutate them through the handles returned by
/// [`devices`](Self::devices) and [`bus_events`](Self::bus_events)
/// while a monitor worker owns the driver.
pub struct MockDriver {
    hotplug: bool,
    devices: Arc<Mutex<Vec<DeviceIdentity>>>,
    events: Arc<Mutex<VecDeque<BusEvent>>>,
    fail_open: Arc<Mutex<HashSet<DeviceIdentity>>>,
    opened: Arc<Mutex<Vec<DeviceIdentity>>>,
    live_handles: Arc<AtomicUsize>,
    endpoints_busy: Arc<AtomicBool>,
}

impl MockDriver {
    pub fn new(hotplug: bool) -> Self {
        Self {
            hotplug,
            devices: Arc::new(Mutex::new(Vec::new())),
            events: Arc::new(Mutex::new(VecDeque::new())),
            fail_open: Arc::new(Mutex::new(HashSet::new())),
            opened: Arc::new(Mutex::new(Vec::new())),
            live_handles: Arc::new(AtomicUsize::new(0)),
            endpoints_busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The current system device list, as the driver will enumerate it.
    pub fn devices(&self) -> Arc<Mutex<Vec<DeviceIdentity>>> {
        self.devices.clone()
    }

    /// Queue of bus events delivered by the next pump.
    pub fn bus_events(&self) -> Arc<Mutex<VecDeque<BusEvent>>> {
        self.events.clone()
    }

    /// Identities whose `open_device`/`open_endpoints` should fail.
    pub fn fail_open(&self) -> Arc<Mutex<HashSet<DeviceIdentity>>> {
        self.fail_open.clone()
    }

    /// Log of successful `open_device` calls, in order.
    pub fn opened(&self) -> Arc<Mutex<Vec<DeviceIdentity>>> {
        self.opened.clone()
    }

    /// Raw handles currently alive (opened and not yet dropped).
    pub fn live_handles(&self) -> Arc<AtomicUsize> {
        self.live_handles.clone()
    }
}

impl HostDriver for MockDriver {
    type Device = MockDeviceHandle;
    type Endpoints = MockEndpoints;

    fn list_devices(&self) -> Result<Vec<DeviceIdentity>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn supports_events(&self) -> bool {
        self.hotplug
    }

    fn subscribe(&mut self) -> Result<()> {
        Ok(())
    }

    fn pump_events(&mut self, timeout: Duration) -> Result<Vec<BusEvent>> {
        let drained: Vec<BusEvent> = {
            let mut events = self.events.lock().unwrap();
            events.drain(..).collect()
        };
        if drained.is_empty() {
            // Simulate the pump blocking until its timeout
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
        }
        Ok(drained)
    }

    fn open_device(&self, identity: DeviceIdentity) -> Result<Self::Device> {
        if self.fail_open.lock().unwrap().contains(&identity) {
            return Err(Error::DeviceUnavailable {
                identity,
                reason: "injected open failure".to_string(),
            });
        }
        self.opened.lock().unwrap().push(identity);
        self.live_handles.fetch_add(1, Ordering::AcqRel);
        Ok(MockDeviceHandle {
            live: self.live_handles.clone(),
        })
    }

    fn open_endpoints(
        &self,
        identity: DeviceIdentity,
        _config: &DeviceConfig,
        _endpoints: EndpointPair,
        _direction: Direction,
    ) -> Result<Self::Endpoints> {
        if self.fail_open.lock().unwrap().contains(&identity) {
            return Err(Error::DeviceUnavailable {
                identity,
                reason: "injected open failure".to_string(),
            });
        }
        if self.endpoints_busy.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy(identity));
        }
        Ok(MockEndpoints::exclusive(self.endpoints_busy.clone()))
    }
}

/// Timeout wrapper for async tests, preventing a lost notification
/// from hanging the suite.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> std::result::Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_reads_play_back_in_order() {
        let endpoints = MockEndpoints::scripted(vec![
            ReadStep::Data(vec![1, 2]),
            ReadStep::Empty,
            ReadStep::Data(vec![3]),
        ]);
        let mut buf = [0u8; 8];

        assert_eq!(endpoints.try_read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[1, 2]);
        assert_eq!(endpoints.try_read(&mut buf).unwrap(), 0);
        assert_eq!(endpoints.try_read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3);
        // Script exhausted: no data pending from here on
        assert_eq!(endpoints.try_read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_log() {
        let endpoints = MockEndpoints::idle();
        let written = endpoints.written();

        assert_eq!(endpoints.write(&[0xf1, 0x80]).unwrap(), 2);
        assert_eq!(*written.lock().unwrap(), vec![0xf1, 0x80]);
    }

    #[test]
    fn test_exclusive_endpoints() {
        let driver = MockDriver::new(false);
        let dev = identity(0x0483, 0x3748);

        let first = driver
            .open_endpoints(dev, &DeviceConfig::default(), EndpointPair::new(0x81, 0x02), Direction::ReadWrite)
            .unwrap();
        let second = driver.open_endpoints(
            dev,
            &DeviceConfig::default(),
            EndpointPair::new(0x81, 0x02),
            Direction::ReadWrite,
        );
        assert!(matches!(second, Err(Error::Busy(_))));

        // Releasing the first session frees the endpoints
        drop(first);
        assert!(
            driver
                .open_endpoints(
                    dev,
                    &DeviceConfig::default(),
                    EndpointPair::new(0x81, 0x02),
                    Direction::ReadWrite
                )
                .is_ok()
        );
    }

    #[test]
    fn test_live_handle_accounting() {
        let driver = MockDriver::new(true);
        let live = driver.live_handles();

        let handle = driver.open_device(identity(1, 1)).unwrap();
        assert_eq!(live.load(Ordering::Acquire), 1);
        drop(handle);
        assert_eq!(live.load(Ordering::Acquire), 0);
    }
}
