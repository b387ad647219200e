//! Small value types shared across the USB layers

use crate::descriptors::{ConfigDescriptor, DeviceDescriptor};
use crate::error::UsbError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable textual handle for a device: `VVVV_PPPP_B_A`
///
/// Vendor and product are four upper-case hex digits, bus and address are
/// decimal. A key lets a caller re-locate a device in a later enumeration
/// without keeping a live native reference around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DeviceKey {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
}

impl DeviceKey {
    pub fn new(vendor_id: u16, product_id: u16, bus_number: u8, address: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            bus_number,
            address,
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}_{:04X}_{}_{}",
            self.vendor_id, self.product_id, self.bus_number, self.address
        )
    }
}

impl FromStr for DeviceKey {
    type Err = UsbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('_').collect();
        if parts.len() != 4 {
            return Err(UsbError::InvalidParameter);
        }

        let hex = |p: &str| u16::from_str_radix(p, 16).map_err(|_| UsbError::InvalidParameter);
        let dec = |p: &str| p.parse::<u8>().map_err(|_| UsbError::InvalidParameter);

        Ok(Self {
            vendor_id: hex(parts[0])?,
            product_id: hex(parts[1])?,
            bus_number: dec(parts[2])?,
            address: dec(parts[3])?,
        })
    }
}

impl From<DeviceKey> for String {
    fn from(key: DeviceKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = UsbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceSpeed {
    #[default]
    Unknown,
    /// 1.5 Mbps
    Low,
    /// 12 Mbps
    Full,
    /// 480 Mbps
    High,
    /// 5 Gbps
    Super,
    /// 10 Gbps
    SuperPlus,
}

/// Everything enumeration learns about one device
///
/// Built from a point-in-time snapshot; holds no native reference. Use
/// `key` to find the device again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub key: DeviceKey,
    pub bus_number: u8,
    pub address: u8,
    /// Zero when the device is attached directly to a root hub port we cannot resolve
    pub port_number: u8,
    /// Port numbers from the root hub down to the device
    pub port_path: Vec<u8>,
    pub speed: DeviceSpeed,
    pub descriptor: DeviceDescriptor,
    /// Configurations that decoded successfully
    pub configurations: Vec<ConfigDescriptor>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceInfo {
    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }
}

/// Final state reported by the native layer for an asynchronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    /// Map the status onto the error taxonomy
    ///
    /// A stalled endpoint surfaces as [`UsbError::ResourceBusy`]: the device
    /// refused the request but is still there.
    pub fn into_result(self) -> Result<(), UsbError> {
        match self {
            TransferStatus::Completed => Ok(()),
            TransferStatus::Error => Err(UsbError::Io),
            TransferStatus::TimedOut => Err(UsbError::Timeout),
            TransferStatus::Cancelled => Err(UsbError::Interrupted),
            TransferStatus::Stall => Err(UsbError::ResourceBusy),
            TransferStatus::NoDevice => Err(UsbError::NoDevice),
            TransferStatus::Overflow => Err(UsbError::Overflow),
        }
    }

    /// Status for an error a blocking native transfer returned, or `None`
    /// when the error means the transfer never ran
    pub fn from_error(error: &UsbError) -> Option<Self> {
        match error {
            UsbError::Timeout => Some(TransferStatus::TimedOut),
            UsbError::Interrupted => Some(TransferStatus::Cancelled),
            UsbError::Pipe => Some(TransferStatus::Stall),
            UsbError::NoDevice => Some(TransferStatus::NoDevice),
            UsbError::Overflow => Some(TransferStatus::Overflow),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_key_format() {
        let key = DeviceKey::new(0x1234, 0x5678, 3, 17);
        assert_eq!(key.to_string(), "1234_5678_3_17");

        let key = DeviceKey::new(0x04f9, 0xabcd, 1, 2);
        assert_eq!(key.to_string(), "04F9_ABCD_1_2");
    }

    #[test]
    fn test_device_key_parse() {
        let key: DeviceKey = "04f9_ABCD_1_120".parse().unwrap();
        assert_eq!(key, DeviceKey::new(0x04f9, 0xabcd, 1, 120));

        assert!("1234_5678_3".parse::<DeviceKey>().is_err());
        assert!("XYZW_5678_3_1".parse::<DeviceKey>().is_err());
        assert!("1234_5678_300_1".parse::<DeviceKey>().is_err());
    }

    #[test]
    fn test_transfer_status_mapping() {
        assert_eq!(TransferStatus::Completed.into_result(), Ok(()));
        assert_eq!(
            TransferStatus::Cancelled.into_result(),
            Err(UsbError::Interrupted)
        );
        assert_eq!(
            TransferStatus::TimedOut.into_result(),
            Err(UsbError::Timeout)
        );
        assert_eq!(
            TransferStatus::Stall.into_result(),
            Err(UsbError::ResourceBusy)
        );
        assert_eq!(
            TransferStatus::NoDevice.into_result(),
            Err(UsbError::NoDevice)
        );
    }

    #[test]
    fn test_transfer_status_from_error() {
        assert_eq!(
            TransferStatus::from_error(&UsbError::Overflow),
            Some(TransferStatus::Overflow)
        );
        assert_eq!(
            TransferStatus::from_error(&UsbError::Pipe),
            Some(TransferStatus::Stall)
        );
        assert_eq!(
            TransferStatus::from_error(&UsbError::Interrupted),
            Some(TransferStatus::Cancelled)
        );
        assert_eq!(TransferStatus::from_error(&UsbError::AccessDenied), None);
    }
}
