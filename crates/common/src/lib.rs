//! Shared plumbing for usb-host
//!
//! The crate error type, `tracing` setup, TOML configuration, the channel
//! bridge between async callers and the USB worker thread, and test fixtures.

pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{
    EventSender, SessionId, TransferCommand, TransferReply, UsbBridge, UsbCommand, UsbEvent,
    UsbWorker, create_usb_bridge,
};
pub use config::{HostConfig, LoggingSettings, TransferMode, TransferSettings, UsbSettings};
pub use error::{Error, Result};
pub use logging::{init_test_logging, setup_logging};
