//! Host-controller driver interface
//!
//! The presence tracker and transfer channel never touch libusb
//! directly; they talk to these traits. The production implementation
//! is [`crate::libusb::LibusbDriver`], tests use the mocks in
//! [`crate::test_utils`].

use crate::error::Result;
use crate::types::{DeviceConfig, DeviceIdentity, Direction, EndpointPair};
use std::time::Duration;

/// A single-device bus event delivered by an event-driven driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    Arrived(DeviceIdentity),
    Departed(DeviceIdentity),
}

/// An exclusively owned read/write bulk endpoint pair on one open
/// device. Releasing ownership is done by dropping the value.
pub trait BulkEndpoints: Send + Sync + 'static {
    /// Attempt one non-blocking read into `buf`.
    ///
    /// Returns `Ok(0)` when the device had no data pending; that is
    /// not an error. An `Err` means this one read failed, it says
    /// nothing about the endpoint as a whole.
    fn try_read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Submit `data` to the write endpoint. Returns the byte count
    /// the endpoint accepted.
    fn write(&self, data: &[u8]) -> Result<usize>;
}

/// The external USB host-controller driver collaborator.
///
/// Provides point-in-time enumeration, optional event-driven hotplug
/// delivery, and raw device/endpoint open primitives. One instance is
/// owned by a single monitor worker.
pub trait HostDriver: Send + 'static {
    /// Raw handle to an open device. Closed on drop.
    type Device: Send;

    /// Endpoint pair handle for bulk transfers.
    type Endpoints: BulkEndpoints;

    /// Enumerate the identities currently attached to the bus.
    fn list_devices(&self) -> Result<Vec<DeviceIdentity>>;

    /// Whether this driver can deliver bus events. Consulted once at
    /// startup; the chosen mode never changes afterwards.
    fn supports_events(&self) -> bool;

    /// Arm event delivery. Events accumulate until the next
    /// [`pump_events`](Self::pump_events) call.
    fn subscribe(&mut self) -> Result<()>;

    /// Process pending bus activity, blocking for at most `timeout`,
    /// and return the events that fired.
    fn pump_events(&mut self, timeout: Duration) -> Result<Vec<BusEvent>>;

    /// Open a raw handle to the first attached device matching
    /// `identity`.
    fn open_device(&self, identity: DeviceIdentity) -> Result<Self::Device>;

    /// Acquire exclusive ownership of a device's bulk endpoint pair
    /// for the requested direction set.
    ///
    /// Fails with [`crate::Error::Busy`] when another session already
    /// owns the endpoints, and [`crate::Error::DeviceUnavailable`]
    /// when the device cannot be opened at all.
    fn open_endpoints(
        &self,
        identity: DeviceIdentity,
        config: &DeviceConfig,
        endpoints: EndpointPair,
        direction: Direction,
    ) -> Result<Self::Endpoints>;
}
