//! Error types
//!
//! One taxonomy for the whole crate. Only driver-context startup is
//! fatal; per-device and per-transfer failures stay local to the
//! operation that hit them.

use crate::types::DeviceIdentity;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Driver context could not start. Fatal: no tracker or channel
    /// is usable after this.
    #[error("driver initialization failed: {0}")]
    Init(String),

    /// Open or enumerate failed for one specific device. Local;
    /// other devices are unaffected.
    #[error("device {identity} unavailable: {reason}")]
    DeviceUnavailable {
        identity: DeviceIdentity,
        reason: String,
    },

    /// The device's endpoints are already owned by another session.
    #[error("device {0} is busy or already open")]
    Busy(DeviceIdentity),

    /// A single read or write failed. The session stays open.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Operation rejected synchronously because the session or
    /// tracker is not in a state that allows it. No side effects.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Bridge channel to the worker thread broke down.
    #[error("channel error: {0}")]
    Channel(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DeviceUnavailable {
            identity: DeviceIdentity::new(0x0483, 0x3748),
            reason: "no such device".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0483:3748"));
        assert!(msg.contains("no such device"));
    }

    #[test]
    fn test_invalid_state_display() {
        let err = Error::InvalidState("session is closed");
        assert!(format!("{}", err).contains("session is closed"));
    }
}
