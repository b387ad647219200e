//! Device enumeration
//!
//! Turns a point-in-time [`DeviceList`] into owned [`UsbDeviceInfo`] records
//! that hold no native reference, and re-locates devices by [`DeviceKey`].
//! Every function here disposes the snapshot it takes before returning.

use super::context::Context;
use super::device::{Device, DeviceList};
use super::handle::DeviceHandle;
use common::HostConfig;
use common::config::filter_allows;
use protocol::{DeviceDescriptor, DeviceKey, Result, UsbError};
use tracing::{debug, warn};

pub use protocol::DeviceInfo as UsbDeviceInfo;

/// Which devices enumeration reports and how much it reads from them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumerationPolicy {
    /// VID:PID patterns (`0x1234:0x5678`, `0x1234:*`); empty allows all
    pub filters: Vec<String>,
    /// Drop devices whose descriptor reports bcdUSB 0
    pub skip_invalid_descriptors: bool,
    /// Open each device briefly to read its manufacturer, product and serial
    pub read_strings: bool,
}

impl Default for EnumerationPolicy {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            skip_invalid_descriptors: true,
            read_strings: false,
        }
    }
}

impl EnumerationPolicy {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            filters: config.usb.filters.clone(),
            skip_invalid_descriptors: config.usb.skip_invalid_descriptors,
            read_strings: config.usb.read_strings,
        }
    }

    /// Whether a device with `descriptor` should be reported
    pub fn allows(&self, descriptor: &DeviceDescriptor) -> bool {
        if !filter_allows(descriptor.vendor_id, descriptor.product_id, &self.filters) {
            return false;
        }
        !(self.skip_invalid_descriptors && descriptor.usb_version == 0)
    }
}

/// Describe every connected device the policy allows
pub fn enumerate(context: &Context, policy: &EnumerationPolicy) -> Result<Vec<UsbDeviceInfo>> {
    let list = context.devices()?;
    let mut devices = Vec::with_capacity(list.len());

    for device in &list {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e @ UsbError::AlreadyDisposed(_)) => return Err(e),
            Err(e) => {
                warn!("Skipping device with unreadable descriptor: {}", e);
                continue;
            }
        };

        if !filter_allows(descriptor.vendor_id, descriptor.product_id, &policy.filters) {
            debug!(
                "Device ignored by filter: vid={:#06x}, pid={:#06x}",
                descriptor.vendor_id, descriptor.product_id
            );
            continue;
        }
        if policy.skip_invalid_descriptors && descriptor.usb_version == 0 {
            warn!(
                "Skipping device {:04x}:{:04x} reporting bcdUSB 0",
                descriptor.vendor_id, descriptor.product_id
            );
            continue;
        }

        match describe(device, policy.read_strings) {
            Ok(info) => devices.push(info),
            Err(e @ UsbError::AlreadyDisposed(_)) => return Err(e),
            Err(e) => warn!("Failed to describe device: {}", e),
        }
    }

    list.dispose();
    debug!("Enumerated {} devices", devices.len());
    Ok(devices)
}

/// Build the owned record for one device
///
/// Configurations that fail to decode are logged and left out; the rest of
/// the device is still reported.
pub fn describe(device: &Device, read_strings: bool) -> Result<UsbDeviceInfo> {
    let descriptor = device.device_descriptor()?;
    let key = device.key()?;

    let configurations = (0..descriptor.num_configurations)
        .filter_map(|index| match device.config_descriptor(index) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Skipping configuration {} of {}: {}", index, key, e);
                None
            }
        })
        .collect();

    let (manufacturer, product, serial_number) = if read_strings {
        read_device_strings(device, &descriptor)
    } else {
        (None, None, None)
    };

    Ok(UsbDeviceInfo {
        key,
        bus_number: device.bus_number()?,
        address: device.address()?,
        port_number: device.port_number()?,
        port_path: device.port_path()?,
        speed: device.speed()?,
        descriptor,
        configurations,
        manufacturer,
        product,
        serial_number,
    })
}

fn read_device_strings(
    device: &Device,
    descriptor: &DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let handle = match device.open() {
        Ok(handle) => handle,
        Err(e) => {
            debug!("Could not open device to read strings: {}", e);
            return (None, None, None);
        }
    };

    let read = |index: Option<u8>| {
        index.and_then(|i| match handle.read_string_descriptor_ascii(i) {
            Ok(text) => Some(text),
            Err(e) => {
                debug!("Could not read string {}: {}", i, e);
                None
            }
        })
    };
    let strings = (
        read(descriptor.manufacturer_string_index()),
        read(descriptor.product_string_index()),
        read(descriptor.serial_number_string_index()),
    );

    handle.dispose();
    strings
}

/// Find the device `key` names inside `list`
pub fn find_device(list: &DeviceList, key: &DeviceKey) -> Result<Option<Device>> {
    for device in list {
        match device.key() {
            Ok(k) if k == *key => return Ok(Some(device.clone())),
            Ok(_) => {}
            Err(e @ UsbError::AlreadyDisposed(_)) => return Err(e),
            Err(_) => {}
        }
    }
    Ok(None)
}

/// Open the device `key` names; the handle outlives the snapshot used to
/// find it
pub fn open_by_key(context: &Context, key: &DeviceKey) -> Result<DeviceHandle> {
    let list = context.devices()?;
    let result = match find_device(&list, key)? {
        Some(device) => device.open(),
        None => {
            debug!("No device matches {}", key);
            Err(UsbError::NotFound)
        }
    };
    list.dispose();
    result
}
