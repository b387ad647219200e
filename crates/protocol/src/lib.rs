//! USB wire-level types for usb-host
//!
//! This crate holds everything that can be expressed without talking to a
//! host controller: the error taxonomy, control transfer setup packets,
//! descriptor decoding and the class-specific helpers built on top of it.
//!
//! # Example
//!
//! ```
//! use protocol::{ControlSetup, DeviceDescriptor, DeviceKey};
//!
//! // GET_DESCRIPTOR(DEVICE), 18 bytes
//! let setup = ControlSetup::get_descriptor(0x01, 0, 0, 18);
//! assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
//!
//! let raw = [
//!     0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x34, 0x12, 0x78, 0x56,
//!     0x00, 0x01, 0x00, 0x00, 0x00, 0x01,
//! ];
//! let desc = DeviceDescriptor::parse(&raw).unwrap();
//! let key = DeviceKey::new(desc.vendor_id, desc.product_id, 3, 17);
//! assert_eq!(key.to_string(), "1234_5678_3_17");
//! ```

pub mod descriptors;
pub mod error;
pub mod setup;
pub mod strings;
pub mod types;
pub mod uvc;

pub use descriptors::{
    ConfigDescriptor, DescriptorIter, DeviceDescriptor, EndpointDescriptor, EndpointTransferType,
    Interface, InterfaceDescriptor, parse_config,
};
pub use error::{DescriptorError, ErrorClass, Result, UsbError};
pub use setup::{ControlSetup, Direction, Recipient, RequestType, SETUP_PACKET_LEN};
pub use strings::{LANGUAGE_EN_US, decode_language_ids, decode_string_descriptor};
pub use types::{DeviceInfo, DeviceKey, DeviceSpeed, TransferStatus};
