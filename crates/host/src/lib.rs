//! Host-side USB access
//!
//! [`native`] is the seam to the host controller driver: a libusb backend
//! and an in-memory double. [`usb`] builds the safe ownership graph,
//! blocking transfers and enumeration on top of it.

pub mod native;
pub mod usb;

pub use native::{HotplugEventKind, HotplugFilter, LibusbBackend, UsbBackend};
pub use usb::{
    CancellationToken, Context, ContextOptions, Device, DeviceHandle, DeviceList,
    EnumerationPolicy, HotplugEvent, HotplugRegistration, TransferOutcome, TransferRequest,
    TransferTarget, UsbDeviceInfo, spawn_usb_worker,
};
