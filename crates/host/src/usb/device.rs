//! Device snapshots
//!
//! A [`DeviceList`] holds one native reference per device for as long as it
//! lives. [`Device`] values are cheap clones pointing back into their list
//! with bus, address, port and the decoded device descriptor cached at
//! capture time; they never hold an open handle and stop working once the
//! list or its context is disposed.

use super::context::{ContextShared, CtxState};
use super::handle::DeviceHandle;
use crate::native::{NativeContext, NativeDevice, UsbBackend};
use protocol::{
    ConfigDescriptor, DeviceDescriptor, DeviceKey, DeviceSpeed, Result, UsbError, parse_config,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

struct ListState {
    disposed: bool,
    devices: Vec<NativeDevice>,
}

pub(crate) struct ListShared {
    ctx: Arc<ContextShared>,
    state: Mutex<ListState>,
}

impl ListShared {
    fn lock(&self) -> MutexGuard<'_, ListState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop every captured reference; the caller holds the context write lock
    pub(crate) fn release(&self) {
        let devices = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.devices)
        };
        for device in &devices {
            self.ctx.backend.unref_device(*device);
        }
        debug!("Released device list ({} references)", devices.len());
    }

    /// Native context if both the context and this list are still usable
    fn check(&self, ctx: &CtxState) -> Result<NativeContext> {
        let native = ctx.live()?;
        if self.lock().disposed {
            return Err(UsbError::disposed("device list"));
        }
        Ok(native)
    }
}

/// Point-in-time snapshot of the connected devices
///
/// Dropping the list disposes it. Handles already opened from its devices
/// are unaffected.
pub struct DeviceList {
    shared: Arc<ListShared>,
    devices: Vec<Device>,
}

impl DeviceList {
    /// Take a snapshot; the caller holds the context read lock
    pub(crate) fn capture(ctx: &Arc<ContextShared>, native: NativeContext) -> Result<Self> {
        let natives = ctx.backend.get_device_list(native)?;
        let shared = Arc::new(ListShared {
            ctx: ctx.clone(),
            state: Mutex::new(ListState {
                disposed: false,
                devices: natives.clone(),
            }),
        });

        let devices: Vec<Device> = natives
            .into_iter()
            .filter_map(|native| Device::capture(&shared, native))
            .collect();
        debug!("Captured {} devices", devices.len());

        Ok(Self { shared, devices })
    }

    pub(crate) fn downgrade(&self) -> Weak<ListShared> {
        Arc::downgrade(&self.shared)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    /// Release every device reference; idempotent
    pub fn dispose(&self) {
        let _ctx = self.shared.ctx.write();
        self.shared.release();
    }
}

impl<'a> IntoIterator for &'a DeviceList {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for DeviceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceList")
            .field("devices", &self.devices)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Reference to one native device record inside a [`DeviceList`]
#[derive(Clone)]
pub struct Device {
    list: Arc<ListShared>,
    native: NativeDevice,
    bus_number: u8,
    address: u8,
    port_number: u8,
    descriptor: Result<DeviceDescriptor>,
}

impl Device {
    /// `None` when the device cannot be located; it stays referenced by the
    /// list but is left out of the snapshot
    fn capture(list: &Arc<ListShared>, native: NativeDevice) -> Option<Self> {
        let backend = &list.ctx.backend;
        let location = backend
            .bus_number(native)
            .and_then(|bus| Ok((bus, backend.device_address(native)?)));
        let (bus_number, address) = match location {
            Ok(location) => location,
            Err(e) => {
                warn!("Skipping device {:?}: cannot read bus or address: {}", native, e);
                return None;
            }
        };
        let port_number = backend.port_number(native).unwrap_or_else(|e| {
            warn!("Port number unavailable for bus {} address {}: {}", bus_number, address, e);
            0
        });
        let descriptor = backend
            .device_descriptor(native)
            .and_then(|raw| DeviceDescriptor::parse(&raw).map_err(UsbError::from));

        Some(Self {
            list: list.clone(),
            native,
            bus_number,
            address,
            port_number,
            descriptor,
        })
    }

    fn ensure_live(&self) -> Result<()> {
        let ctx = self.list.ctx.read();
        self.list.check(&ctx).map(|_| ())
    }

    /// Run a native query while the list is guaranteed to hold its reference
    fn with_native<T>(&self, query: impl FnOnce(&dyn UsbBackend, NativeDevice) -> Result<T>) -> Result<T> {
        let ctx = self.list.ctx.read();
        self.list.check(&ctx)?;
        query(self.list.ctx.backend.as_ref(), self.native)
    }

    pub fn bus_number(&self) -> Result<u8> {
        self.ensure_live().map(|()| self.bus_number)
    }

    pub fn address(&self) -> Result<u8> {
        self.ensure_live().map(|()| self.address)
    }

    /// Zero when the native layer cannot tell
    pub fn port_number(&self) -> Result<u8> {
        self.ensure_live().map(|()| self.port_number)
    }

    /// Port numbers from the root hub down to this device
    pub fn port_path(&self) -> Result<Vec<u8>> {
        self.with_native(|backend, device| backend.port_numbers(device))
    }

    pub fn speed(&self) -> Result<DeviceSpeed> {
        self.with_native(|backend, device| backend.speed(device))
    }

    /// The device descriptor decoded at capture time
    pub fn device_descriptor(&self) -> Result<DeviceDescriptor> {
        self.ensure_live()?;
        self.descriptor.clone()
    }

    /// Raw configuration descriptor set for configuration `index`
    pub fn raw_config_descriptor(&self, index: u8) -> Result<Vec<u8>> {
        self.with_native(|backend, device| backend.config_descriptor(device, index))
    }

    pub fn config_descriptor(&self, index: u8) -> Result<ConfigDescriptor> {
        let raw = self.raw_config_descriptor(index)?;
        Ok(parse_config(&raw)?)
    }

    pub fn active_config_descriptor(&self) -> Result<ConfigDescriptor> {
        let raw = self.with_native(|backend, device| backend.active_config_descriptor(device))?;
        Ok(parse_config(&raw)?)
    }

    pub fn key(&self) -> Result<DeviceKey> {
        let descriptor = self.device_descriptor()?;
        Ok(DeviceKey::new(
            descriptor.vendor_id,
            descriptor.product_id,
            self.bus_number,
            self.address,
        ))
    }

    /// Open a native session; the handle outlives this device and its list
    pub fn open(&self) -> Result<DeviceHandle> {
        let ctx = &self.list.ctx;
        let mut state = ctx.write();
        self.list.check(&state)?;

        let native = ctx.backend.open(self.native)?;
        state.handle_opened();
        drop(state);

        debug!(
            "Opened device bus={} addr={}",
            self.bus_number, self.address
        );
        Ok(DeviceHandle::new(
            ctx.clone(),
            native,
            self.bus_number,
            self.address,
        ))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Device");
        s.field("bus_number", &self.bus_number)
            .field("address", &self.address);
        if let Ok(descriptor) = &self.descriptor {
            s.field("vendor_id", &format_args!("{:#06x}", descriptor.vendor_id))
                .field("product_id", &format_args!("{:#06x}", descriptor.product_id));
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{FakeDeviceSpec, FakeUsb};
    use crate::usb::{Context, ContextOptions};
    use common::test_utils::{ConfigBuilder, device_descriptor_bytes};

    fn context_with_device() -> (Arc<FakeUsb>, Context) {
        let spec = FakeDeviceSpec::new(2, 7, &device_descriptor_bytes(0x1234, 0x5678, 0x0200))
            .with_port_path(vec![1, 4])
            .with_config(
                ConfigBuilder::new(1)
                    .interface(0, 0, 0xFF)
                    .endpoint(0x81, 0x02, 512)
                    .build(),
            );
        let fake = Arc::new(FakeUsb::with_devices([spec]));
        let ctx = Context::new(fake.clone(), ContextOptions::default()).unwrap();
        (fake, ctx)
    }

    #[test]
    fn test_cached_fields() {
        let (_fake, ctx) = context_with_device();
        let list = ctx.devices().unwrap();
        let device = list.get(0).unwrap();

        assert_eq!(device.bus_number().unwrap(), 2);
        assert_eq!(device.address().unwrap(), 7);
        assert_eq!(device.port_number().unwrap(), 4);
        assert_eq!(device.port_path().unwrap(), vec![1, 4]);
        assert_eq!(device.key().unwrap().to_string(), "1234_5678_2_7");
    }

    #[test]
    fn test_unlocatable_device_left_out() {
        let good = FakeDeviceSpec::new(1, 2, &device_descriptor_bytes(0x1234, 0x5678, 0x0200));
        let lost = FakeDeviceSpec::new(1, 3, &device_descriptor_bytes(0xABCD, 0x0001, 0x0200))
            .with_location_error(UsbError::Io);
        let fake = Arc::new(FakeUsb::with_devices([good, lost]));
        let ctx = Context::new(fake.clone(), ContextOptions::default()).unwrap();

        let list = ctx.devices().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().key().unwrap().to_string(), "1234_5678_1_2");
        assert!(list.iter().all(|d| d.bus_number().unwrap() != 0));

        // The skipped device's reference is still released with the list
        list.dispose();
        assert_eq!(fake.live_devices(), 0);
        assert_eq!(fake.counters().misuse(), 0);
    }

    #[test]
    fn test_config_descriptor_decodes() {
        let (_fake, ctx) = context_with_device();
        let list = ctx.devices().unwrap();
        let config = list.get(0).unwrap().config_descriptor(0).unwrap();
        assert_eq!(config.configuration_value, 1);
        assert_eq!(config.interfaces.len(), 1);

        assert!(matches!(
            list.get(0).unwrap().config_descriptor(3),
            Err(UsbError::NotFound)
        ));
    }

    #[test]
    fn test_device_invalid_after_list_dispose() {
        let (fake, ctx) = context_with_device();
        let list = ctx.devices().unwrap();
        let device = list.get(0).unwrap().clone();

        list.dispose();
        list.dispose();
        assert!(matches!(
            device.device_descriptor(),
            Err(UsbError::AlreadyDisposed(_))
        ));
        assert!(matches!(device.open(), Err(UsbError::AlreadyDisposed(_))));
        assert_eq!(fake.live_devices(), 0);
        assert_eq!(fake.counters().misuse(), 0);
    }
}
