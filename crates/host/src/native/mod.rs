//! Native capability surface
//!
//! The narrow set of primitives the ownership graph and the transfer bridge
//! are built on. Everything above this trait speaks [`UsbError`]; native
//! error codes never cross it.
//!
//! Resources are named by opaque `Copy` ids. The ids carry no lifetime: the
//! wrappers in [`crate::usb`] decide when an id may still be used, and the
//! backend only has to stay memory safe when it is handed a stale one.

pub mod fake;
pub mod libusb;

pub use fake::{FakeCounters, FakeDeviceSpec, FakeUsb, TransferBehavior};
pub use libusb::LibusbBackend;

use protocol::{ControlSetup, DeviceSpeed, Result, TransferStatus, UsbError};
use std::time::Duration;

/// A native driver session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeContext(pub u64);

/// One reference-counted native device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeDevice(pub u64);

/// An open native device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// An allocated asynchronous transfer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeTransfer(pub u64);

/// A registered hotplug callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHotplug(pub u64);

/// What the native layer still held when a context was torn down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub referenced_devices: usize,
    pub open_handles: usize,
}

impl ExitReport {
    pub fn is_clean(&self) -> bool {
        self.referenced_devices == 0 && self.open_handles == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOption {
    /// 0 = none, 1 = error, 2 = warning, 3 = info, 4 = debug
    LogLevel(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
}

/// Fields populated on a transfer record before submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSetup {
    pub handle: NativeHandle,
    pub endpoint: u8,
    pub kind: TransferKind,
    /// Zero means no timeout
    pub timeout: Duration,
}

/// Delivered exactly once per submitted transfer
///
/// For control transfers `buffer` still starts with the 8 setup bytes and
/// `actual_length` counts payload bytes only.
#[derive(Debug)]
pub struct TransferCompletion {
    pub status: TransferStatus,
    pub actual_length: usize,
    pub buffer: Vec<u8>,
}

pub type CompletionCallback = Box<dyn FnOnce(TransferCompletion) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEventKind {
    Arrived,
    Left,
}

/// Raw hotplug notification as the native layer reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugNotice {
    pub kind: HotplugEventKind,
    pub bus_number: u8,
    pub address: u8,
    pub port_number: u8,
    /// `None` when the device could no longer be read, typically on departure
    pub descriptor: Option<[u8; 18]>,
}

pub type HotplugCallback = Box<dyn FnMut(HotplugNotice) + Send + 'static>;

/// Which devices a hotplug callback is interested in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HotplugFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub class: Option<u8>,
    /// Deliver an arrival for every matching device already connected
    pub enumerate: bool,
}

impl HotplugFilter {
    /// Matches against a raw device descriptor
    pub fn matches(&self, descriptor: &[u8; 18]) -> bool {
        let vendor_id = u16::from_le_bytes([descriptor[8], descriptor[9]]);
        let product_id = u16::from_le_bytes([descriptor[10], descriptor[11]]);
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
            && self.class.is_none_or(|c| c == descriptor[4])
    }
}

/// Operations a USB host driver must provide
///
/// Implementations must be callable from any thread. Completion and hotplug
/// callbacks may run on a thread owned by the backend and must not be
/// invoked while the backend holds its own internal locks.
pub trait UsbBackend: Send + Sync {
    fn init(&self) -> Result<NativeContext>;
    fn exit(&self, ctx: NativeContext) -> ExitReport;
    fn set_option(&self, ctx: NativeContext, option: NativeOption) -> Result<()>;

    /// Every returned device carries one reference owned by the caller
    fn get_device_list(&self, ctx: NativeContext) -> Result<Vec<NativeDevice>>;
    fn ref_device(&self, device: NativeDevice);
    fn unref_device(&self, device: NativeDevice);

    fn device_descriptor(&self, device: NativeDevice) -> Result<[u8; 18]>;
    /// Full configuration descriptor set (`wTotalLength` bytes)
    fn config_descriptor(&self, device: NativeDevice, index: u8) -> Result<Vec<u8>>;
    fn active_config_descriptor(&self, device: NativeDevice) -> Result<Vec<u8>>;
    fn bus_number(&self, device: NativeDevice) -> Result<u8>;
    fn device_address(&self, device: NativeDevice) -> Result<u8>;
    fn port_number(&self, device: NativeDevice) -> Result<u8>;
    fn port_numbers(&self, device: NativeDevice) -> Result<Vec<u8>>;
    fn speed(&self, device: NativeDevice) -> Result<DeviceSpeed>;

    fn open(&self, device: NativeDevice) -> Result<NativeHandle>;
    fn close(&self, handle: NativeHandle);
    fn claim_interface(&self, handle: NativeHandle, interface: u8) -> Result<()>;
    fn release_interface(&self, handle: NativeHandle, interface: u8) -> Result<()>;
    fn set_interface_alt_setting(
        &self,
        handle: NativeHandle,
        interface: u8,
        alt_setting: u8,
    ) -> Result<()>;
    fn kernel_driver_active(&self, handle: NativeHandle, interface: u8) -> Result<bool>;
    fn detach_kernel_driver(&self, handle: NativeHandle, interface: u8) -> Result<()>;
    fn attach_kernel_driver(&self, handle: NativeHandle, interface: u8) -> Result<()>;
    fn reset_device(&self, handle: NativeHandle) -> Result<()>;
    fn clear_halt(&self, handle: NativeHandle, endpoint: u8) -> Result<()>;

    /// Raw string descriptor bytes; returns the number of bytes written
    fn get_string_descriptor(
        &self,
        handle: NativeHandle,
        index: u8,
        language: u16,
        buf: &mut [u8],
    ) -> Result<usize>;
    /// String in the first supported language, narrowed to ASCII by the native layer
    fn get_string_descriptor_ascii(
        &self,
        handle: NativeHandle,
        index: u8,
        buf: &mut [u8],
    ) -> Result<usize>;

    /// Blocking control transfer; `data` is the payload without setup bytes
    ///
    /// The blocking primitives report how the transfer ended together with
    /// the bytes moved, so a timeout or overflow still hands back partial
    /// progress. `Err` is reserved for calls that never reached the device.
    fn control_transfer(
        &self,
        handle: NativeHandle,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(TransferStatus, usize)>;
    fn bulk_transfer(
        &self,
        handle: NativeHandle,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(TransferStatus, usize)>;
    fn interrupt_transfer(
        &self,
        handle: NativeHandle,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(TransferStatus, usize)>;

    fn alloc_transfer(&self) -> Result<NativeTransfer>;
    /// Submit a populated transfer
    ///
    /// On success the backend owns `buffer` until it hands it back through
    /// `on_complete`, which is called exactly once. On failure neither is
    /// retained and `on_complete` is never called.
    fn submit_transfer(
        &self,
        transfer: NativeTransfer,
        setup: TransferSetup,
        buffer: Vec<u8>,
        on_complete: CompletionCallback,
    ) -> Result<()>;
    /// Ask for early completion; the result is advisory only
    fn cancel_transfer(&self, transfer: NativeTransfer) -> Result<()>;
    fn free_transfer(&self, transfer: NativeTransfer);

    fn register_hotplug(
        &self,
        ctx: NativeContext,
        filter: HotplugFilter,
        callback: HotplugCallback,
    ) -> Result<NativeHotplug>;
    fn deregister_hotplug(&self, ctx: NativeContext, hotplug: NativeHotplug);

    /// Human readable description of an error, in the native layer's words
    fn strerror(&self, error: &UsbError) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hotplug_filter_matches() {
        let mut descriptor = [0u8; 18];
        descriptor[4] = 0xEF;
        descriptor[8..10].copy_from_slice(&0x1234u16.to_le_bytes());
        descriptor[10..12].copy_from_slice(&0x5678u16.to_le_bytes());

        assert!(HotplugFilter::default().matches(&descriptor));
        let filter = HotplugFilter {
            vendor_id: Some(0x1234),
            class: Some(0xEF),
            ..Default::default()
        };
        assert!(filter.matches(&descriptor));

        let filter = HotplugFilter {
            product_id: Some(0x0001),
            ..Default::default()
        };
        assert!(!filter.matches(&descriptor));
    }

    #[test]
    fn test_exit_report_clean() {
        assert!(ExitReport::default().is_clean());
        assert!(
            !ExitReport {
                referenced_devices: 1,
                open_handles: 0
            }
            .is_clean()
        );
    }
}
