//! USB device presence tracking and bulk transfer channels
//!
//! This crate watches which USB devices are attached to the host and
//! notifies a subscriber once per insertion or removal, using libusb
//! hotplug events when the platform supports them and a fixed-interval
//! enumeration poll otherwise. It also provides a buffered,
//! non-blocking bulk read/write channel to a single opened device.
//!
//! The USB side runs on a dedicated worker thread; async callers talk
//! to it through a channel bridge (see [`monitor`]).

pub mod channel;
pub mod driver;
pub mod error;
pub mod libusb;
pub mod monitor;
pub mod test_utils;
pub mod tracker;
pub mod types;

pub use channel::{ChannelEvent, ChannelOptions, TransferChannel};
pub use driver::{BulkEndpoints, BusEvent, HostDriver};
pub use error::{Error, Result};
pub use libusb::LibusbDriver;
pub use monitor::{MonitorConfig, MonitorHandle, spawn_monitor};
pub use tracker::{PresenceEvent, PresenceTracker};
pub use types::{DeviceConfig, DeviceIdentity, Direction, EndpointPair};
