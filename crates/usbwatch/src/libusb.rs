//! libusb-backed driver
//!
//! Implements [`HostDriver`] on top of rusb. Hotplug arrivals and
//! departures are converted to [`BusEvent`] values inside the libusb
//! callback and queued; `pump_events` runs the libusb event loop and
//! drains the queue. The registration token is owned by the driver
//! instance, so dropping the driver deregisters the callback.

use crate::driver::{BulkEndpoints, BusEvent, HostDriver};
use crate::error::{Error, Result};
use crate::types::{DeviceConfig, DeviceIdentity, Direction, EndpointPair};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for a single non-blocking bulk read attempt. Short, so a
/// poll tick returns quickly when the device has nothing pending.
const READ_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(10);

/// Timeout for bulk writes.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// USB host driver backed by a libusb context.
pub struct LibusbDriver {
    context: Context,
    pending: Arc<Mutex<VecDeque<BusEvent>>>,
    registration: Option<Registration<Context>>,
}

impl LibusbDriver {
    /// Create the libusb context. Failure here is fatal for the whole
    /// subsystem.
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(|e| Error::Init(e.to_string()))?;

        Ok(Self {
            context,
            pending: Arc::new(Mutex::new(VecDeque::new())),
            registration: None,
        })
    }

    fn find_device(&self, identity: DeviceIdentity) -> Result<Device<Context>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::DeviceUnavailable {
                identity,
                reason: e.to_string(),
            })?;

        devices
            .iter()
            .find(|device| {
                device
                    .device_descriptor()
                    .map(|desc| {
                        desc.vendor_id() == identity.vendor_id
                            && desc.product_id() == identity.product_id
                    })
                    .unwrap_or(false)
            })
            .ok_or(Error::DeviceUnavailable {
                identity,
                reason: "not attached".to_string(),
            })
    }
}

impl HostDriver for LibusbDriver {
    type Device = DeviceHandle<Context>;
    type Endpoints = LibusbEndpoints;

    fn list_devices(&self) -> Result<Vec<DeviceIdentity>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::Init(format!("device enumeration failed: {}", e)))?;

        let mut list = Vec::new();
        for device in devices.iter() {
            match device.device_descriptor() {
                Ok(desc) => list.push(DeviceIdentity::new(desc.vendor_id(), desc.product_id())),
                Err(e) => {
                    // A device we cannot describe is skipped, not fatal
                    warn!(
                        "skipping device at bus={} addr={}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                }
            }
        }
        Ok(list)
    }

    fn supports_events(&self) -> bool {
        rusb::has_hotplug()
    }

    fn subscribe(&mut self) -> Result<()> {
        let callback = QueueCallback {
            pending: self.pending.clone(),
        };

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(callback))
            .map_err(|e| Error::Init(format!("hotplug registration failed: {}", e)))?;

        self.registration = Some(registration);
        debug!("hotplug callback registered");
        Ok(())
    }

    fn pump_events(&mut self, timeout: Duration) -> Result<Vec<BusEvent>> {
        match self.context.handle_events(Some(timeout)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                return Err(Error::Transfer(format!("event pump failed: {}", e)));
            }
        }

        let mut pending = self.pending.lock().unwrap();
        Ok(pending.drain(..).collect())
    }

    fn open_device(&self, identity: DeviceIdentity) -> Result<Self::Device> {
        let device = self.find_device(identity)?;
        device.open().map_err(|e| Error::DeviceUnavailable {
            identity,
            reason: e.to_string(),
        })
    }

    fn open_endpoints(
        &self,
        identity: DeviceIdentity,
        config: &DeviceConfig,
        endpoints: EndpointPair,
        direction: Direction,
    ) -> Result<Self::Endpoints> {
        let device = self.find_device(identity)?;
        let handle = device.open().map_err(|e| match e {
            rusb::Error::Busy => Error::Busy(identity),
            _ => Error::DeviceUnavailable {
                identity,
                reason: e.to_string(),
            },
        })?;

        // A configuration already selected by the kernel is fine.
        if let Err(e) = handle.set_active_configuration(config.configuration) {
            debug!(
                "could not set configuration {} on {}: {}",
                config.configuration, identity, e
            );
        }

        match handle.kernel_driver_active(config.interface) {
            Ok(true) => {
                debug!(
                    "detaching kernel driver from interface {} on {}",
                    config.interface, identity
                );
                if let Err(e) = handle.detach_kernel_driver(config.interface) {
                    warn!(
                        "failed to detach kernel driver from interface {}: {}",
                        config.interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "could not check kernel driver status for interface {}: {}",
                    config.interface, e
                );
            }
        }

        handle
            .claim_interface(config.interface)
            .map_err(|e| match e {
                rusb::Error::Busy => Error::Busy(identity),
                _ => Error::DeviceUnavailable {
                    identity,
                    reason: format!("failed to claim interface {}: {}", config.interface, e),
                },
            })?;

        if config.alternate != 0
            && let Err(e) = handle.set_alternate_setting(config.interface, config.alternate)
        {
            warn!(
                "failed to select alternate setting {} on interface {}: {}",
                config.alternate, config.interface, e
            );
        }

        debug!(
            "opened endpoints {:#04x}/{:#04x} on {} ({:?})",
            endpoints.read, endpoints.write, identity, direction
        );

        Ok(LibusbEndpoints {
            handle,
            identity,
            interface: config.interface,
            endpoints,
        })
    }
}

/// Hotplug callback that queues events for the next pump.
struct QueueCallback {
    pending: Arc<Mutex<VecDeque<BusEvent>>>,
}

impl QueueCallback {
    fn push(&self, event: BusEvent) {
        self.pending.lock().unwrap().push_back(event);
    }
}

impl Hotplug<Context> for QueueCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        match device.device_descriptor() {
            Ok(desc) => {
                let identity = DeviceIdentity::new(desc.vendor_id(), desc.product_id());
                debug!("hotplug: device {} arrived", identity);
                self.push(BusEvent::Arrived(identity));
            }
            Err(e) => warn!("hotplug: arrived device has no readable descriptor: {}", e),
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        match device.device_descriptor() {
            Ok(desc) => {
                let identity = DeviceIdentity::new(desc.vendor_id(), desc.product_id());
                debug!("hotplug: device {} left", identity);
                self.push(BusEvent::Departed(identity));
            }
            Err(e) => warn!("hotplug: departed device has no readable descriptor: {}", e),
        }
    }
}

/// Exclusively owned bulk endpoint pair on an open libusb handle.
///
/// Releases the claimed interface and reattaches the kernel driver on
/// drop.
pub struct LibusbEndpoints {
    handle: DeviceHandle<Context>,
    identity: DeviceIdentity,
    interface: u8,
    endpoints: EndpointPair,
}

impl BulkEndpoints for LibusbEndpoints {
    fn try_read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.handle.read_bulk(self.endpoints.read, buf, READ_ATTEMPT_TIMEOUT) {
            Ok(len) => Ok(len),
            // No data pending is the common case for a poll tick
            Err(rusb::Error::Timeout) | Err(rusb::Error::Io) => Ok(0),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        self.handle
            .write_bulk(self.endpoints.write, data, WRITE_TIMEOUT)
            .map_err(map_rusb_error)
    }
}

impl Drop for LibusbEndpoints {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            warn!("failed to release interface {}: {}", self.interface, e);
        }
        if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
            debug!(
                "could not reattach kernel driver to interface {} (may not have been detached): {}",
                self.interface, e
            );
        }
        debug!("closed endpoints on {}", self.identity);
    }
}

/// Map a rusb transfer error into the crate taxonomy.
pub fn map_rusb_error(err: rusb::Error) -> Error {
    Error::Transfer(err.to_string())
}
