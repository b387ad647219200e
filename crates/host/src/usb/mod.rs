//! USB subsystem
//!
//! The resource ownership graph ([`Context`] → [`DeviceList`] → [`Device`]
//! → [`DeviceHandle`]), the synchronous transfer bridge, enumeration and the
//! worker thread that serves async callers.
//!
//! The worker runs in a dedicated thread so blocking native calls never
//! stall the Tokio runtime.

pub mod context;
pub mod device;
pub mod handle;
pub mod hotplug;
pub mod manager;
pub mod transfers;
pub mod worker;

pub use context::{Context, ContextOptions};
pub use device::{Device, DeviceList};
pub use handle::DeviceHandle;
pub use hotplug::{HotplugEvent, HotplugRegistration};
pub use manager::{
    EnumerationPolicy, UsbDeviceInfo, describe, enumerate, find_device, open_by_key,
};
pub use transfers::{CancellationToken, TransferOutcome, TransferRequest, TransferTarget};
pub use worker::{UsbWorkerThread, spawn_usb_worker};
