//! USB value types
//!
//! Plain data: device identity, configuration selection, endpoint
//! addresses. No behavior beyond parsing and formatting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Vendor/product identity of a class of USB device.
///
/// Identifies a device model, not a specific physical unit. Equality
/// is by both fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl FromStr for DeviceIdentity {
    type Err = String;

    /// Parse a `VID:PID` pair, with or without `0x` prefixes
    /// (e.g. `0x0483:0x3748` or `0483:3748`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return Err(format!(
                "invalid identity '{}', expected VID:PID (e.g. '0x0483:0x3748')",
                s
            ));
        }

        let parse_id = |id: &str, name: &str| -> Result<u16, String> {
            let hex = id
                .trim_start_matches("0x")
                .trim_start_matches("0X");
            if hex.is_empty() || hex.len() > 4 {
                return Err(format!("invalid {} '{}', hex part must be 1-4 digits", name, id));
            }
            u16::from_str_radix(hex, 16)
                .map_err(|_| format!("invalid {} '{}', not a valid hex number", name, id))
        };

        Ok(Self {
            vendor_id: parse_id(parts[0], "VID")?,
            product_id: parse_id(parts[1], "PID")?,
        })
    }
}

/// Configuration selection for a device of interest: which
/// configuration, interface and alternate setting to use when opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub interface: u8,
    pub alternate: u8,
    pub configuration: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            interface: 0,
            alternate: 0,
            configuration: 1,
        }
    }
}

/// Bulk endpoint address pair for one device.
///
/// `read` is the IN endpoint (bit 7 set, e.g. 0x81), `write` the OUT
/// endpoint (e.g. 0x02).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    pub read: u8,
    pub write: u8,
}

impl EndpointPair {
    pub const fn new(read: u8, write: u8) -> Self {
        Self { read, write }
    }
}

/// Direction set requested when opening a transfer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    ReadWrite,
}

impl Direction {
    pub fn can_read(self) -> bool {
        matches!(self, Direction::Read | Direction::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Direction::Write | Direction::ReadWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality() {
        let a = DeviceIdentity::new(0x0483, 0x3748);
        let b = DeviceIdentity::new(0x0483, 0x3748);
        let c = DeviceIdentity::new(0x0483, 0x3749);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_identity_display() {
        let id = DeviceIdentity::new(0x0483, 0x3748);
        assert_eq!(id.to_string(), "0483:3748");
    }

    #[test]
    fn test_identity_parse() {
        assert_eq!(
            "0x0483:0x3748".parse::<DeviceIdentity>().unwrap(),
            DeviceIdentity::new(0x0483, 0x3748)
        );
        assert_eq!(
            "0483:3748".parse::<DeviceIdentity>().unwrap(),
            DeviceIdentity::new(0x0483, 0x3748)
        );
        assert_eq!(
            "ABCD:1".parse::<DeviceIdentity>().unwrap(),
            DeviceIdentity::new(0xabcd, 0x0001)
        );
    }

    #[test]
    fn test_identity_parse_invalid() {
        assert!("0483".parse::<DeviceIdentity>().is_err());
        assert!("0483:3748:0001".parse::<DeviceIdentity>().is_err());
        assert!("ghij:3748".parse::<DeviceIdentity>().is_err());
        assert!("12345:3748".parse::<DeviceIdentity>().is_err());
        assert!("0x:3748".parse::<DeviceIdentity>().is_err());
    }

    #[test]
    fn test_default_device_config() {
        let config = DeviceConfig::default();
        assert_eq!(config.interface, 0);
        assert_eq!(config.alternate, 0);
        assert_eq!(config.configuration, 1);
    }

    #[test]
    fn test_direction_flags() {
        assert!(Direction::Read.can_read());
        assert!(!Direction::Read.can_write());
        assert!(Direction::Write.can_write());
        assert!(!Direction::Write.can_read());
        assert!(Direction::ReadWrite.can_read());
        assert!(Direction::ReadWrite.can_write());
    }
}
