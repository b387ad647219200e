//! Hotplug notifications
//!
//! Callbacks run on whatever thread the native layer reports events from
//! (the libusb event thread, or the caller of a simulated arrival in tests).
//! They must not call back into the [`Context`] they were registered on;
//! forward the event over a channel instead.

use super::context::Context;
use crate::native::{HotplugEventKind, HotplugFilter, HotplugNotice, NativeHotplug};
use protocol::{DeviceDescriptor, DeviceKey, Result};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type UserCallback = Box<dyn FnMut(HotplugEvent) + Send + 'static>;

/// A connected or disconnected device
///
/// Departures are still reported when the descriptor can no longer be read;
/// bus and address identify the device while it was attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub kind: HotplugEventKind,
    pub bus_number: u8,
    pub address: u8,
    pub port_number: u8,
    pub descriptor: Option<DeviceDescriptor>,
}

impl HotplugEvent {
    fn from_notice(notice: &HotplugNotice) -> Option<Self> {
        let descriptor = match notice.descriptor.as_ref().map(|raw| DeviceDescriptor::parse(raw)) {
            Some(Ok(descriptor)) => Some(descriptor),
            Some(Err(e)) if notice.kind == HotplugEventKind::Arrived => {
                warn!(
                    "Dropping arrival on bus {} address {}: {}",
                    notice.bus_number, notice.address, e
                );
                return None;
            }
            None if notice.kind == HotplugEventKind::Arrived => {
                warn!(
                    "Dropping arrival on bus {} address {}: descriptor unavailable",
                    notice.bus_number, notice.address
                );
                return None;
            }
            _ => None,
        };
        Some(Self {
            kind: notice.kind,
            bus_number: notice.bus_number,
            address: notice.address,
            port_number: notice.port_number,
            descriptor,
        })
    }

    /// Full key, when the descriptor was readable
    pub fn key(&self) -> Option<DeviceKey> {
        self.descriptor.map(|d| {
            DeviceKey::new(d.vendor_id, d.product_id, self.bus_number, self.address)
        })
    }

    /// Whether `key` names the device this event is about
    pub fn concerns(&self, key: &DeviceKey) -> bool {
        key.bus_number == self.bus_number && key.address == self.address
    }
}

/// Owns the user callback; the native side only holds a weak reference so
/// nothing is delivered once the registration is gone
pub(crate) struct HotplugSlot {
    callback: Mutex<UserCallback>,
}

impl HotplugSlot {
    fn deliver(&self, notice: &HotplugNotice) {
        let Some(event) = HotplugEvent::from_notice(notice) else {
            return;
        };
        let mut callback = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        (*callback)(event);
    }
}

/// Receipt for a registered hotplug callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugRegistration {
    id: NativeHotplug,
}

impl Context {
    /// Register `callback` for devices matching `filter`
    ///
    /// With `filter.enumerate` set, already connected devices are reported
    /// as arrivals before this returns.
    pub fn register_hotplug<F>(&self, filter: HotplugFilter, callback: F) -> Result<HotplugRegistration>
    where
        F: FnMut(HotplugEvent) + Send + 'static,
    {
        let shared = self.shared();
        let state = shared.read();
        let native = state.live()?;

        let slot = Arc::new(HotplugSlot {
            callback: Mutex::new(Box::new(callback)),
        });
        let weak = Arc::downgrade(&slot);
        let id = shared.backend.register_hotplug(
            native,
            filter,
            Box::new(move |notice| {
                if let Some(slot) = weak.upgrade() {
                    slot.deliver(&notice);
                }
            }),
        )?;

        shared.hotplugs().push((id, slot));
        debug!("Registered hotplug callback {:?}", id);
        Ok(HotplugRegistration { id })
    }

    /// Remove a callback; unknown or already removed registrations are ignored
    pub fn deregister_hotplug(&self, registration: &HotplugRegistration) -> Result<()> {
        let shared = self.shared();
        let state = shared.read();
        let native = state.live()?;

        let entry = {
            let mut hotplugs = shared.hotplugs();
            hotplugs
                .iter()
                .position(|(id, _)| *id == registration.id)
                .map(|pos| hotplugs.remove(pos))
        };
        if let Some((id, _slot)) = entry {
            shared.backend.deregister_hotplug(native, id);
            debug!("Deregistered hotplug callback {:?}", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{FakeDeviceSpec, FakeUsb};
    use crate::usb::ContextOptions;
    use common::test_utils::device_descriptor_bytes;

    #[test]
    fn test_event_from_notice() {
        let mut descriptor = [0u8; 18];
        descriptor.copy_from_slice(&device_descriptor_bytes(0x1234, 0x5678, 0x0200));
        let notice = HotplugNotice {
            kind: HotplugEventKind::Arrived,
            bus_number: 3,
            address: 17,
            port_number: 2,
            descriptor: Some(descriptor),
        };

        let event = HotplugEvent::from_notice(&notice).unwrap();
        assert_eq!(event.key().unwrap().to_string(), "1234_5678_3_17");
        assert_eq!(event.port_number, 2);
        assert!(event.concerns(&DeviceKey::new(0x1234, 0x5678, 3, 17)));
        assert!(!event.concerns(&DeviceKey::new(0x1234, 0x5678, 3, 18)));

        let garbage = HotplugNotice {
            descriptor: Some([0u8; 18]),
            ..notice
        };
        assert!(HotplugEvent::from_notice(&garbage).is_none());
        let unreadable = HotplugNotice {
            descriptor: None,
            ..notice
        };
        assert!(HotplugEvent::from_notice(&unreadable).is_none());
    }

    #[test]
    fn test_departure_without_descriptor_kept() {
        for descriptor in [None, Some([0u8; 18])] {
            let notice = HotplugNotice {
                kind: HotplugEventKind::Left,
                bus_number: 3,
                address: 17,
                port_number: 2,
                descriptor,
            };
            let event = HotplugEvent::from_notice(&notice).unwrap();
            assert_eq!(event.kind, HotplugEventKind::Left);
            assert_eq!(event.key(), None);
            assert!(event.concerns(&DeviceKey::new(0xABCD, 0x0001, 3, 17)));
        }
    }

    #[test]
    fn test_deregister_twice_is_harmless() {
        let fake = Arc::new(FakeUsb::with_devices([FakeDeviceSpec::new(
            1,
            2,
            &device_descriptor_bytes(0x1234, 0x5678, 0x0200),
        )]));
        let ctx = Context::new(fake.clone(), ContextOptions::default()).unwrap();

        let registration = ctx.register_hotplug(HotplugFilter::default(), |_| {}).unwrap();
        assert_eq!(fake.hotplug_registrations(), 1);

        ctx.deregister_hotplug(&registration).unwrap();
        ctx.deregister_hotplug(&registration).unwrap();
        assert_eq!(fake.hotplug_registrations(), 0);
        assert_eq!(fake.counters().misuse(), 0);
    }
}
