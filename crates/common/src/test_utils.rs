//! Test utilities for usb-host
//!
//! Descriptor byte builders for feeding the decoder and the in-memory USB
//! backend, plus async timeout helpers.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{ConfigBuilder, device_descriptor_bytes};
//!
//! let device = device_descriptor_bytes(0x1234, 0x5678, 0x0200);
//! assert_eq!(device.len(), 18);
//!
//! let config = ConfigBuilder::new(1)
//!     .interface(0, 0, 0xFF)
//!     .endpoint(0x81, 0x02, 512)
//!     .build();
//! assert_eq!(u16::from_le_bytes([config[2], config[3]]) as usize, config.len());
//! ```

use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build an 18-byte device descriptor with one configuration
///
/// Class is 0 (per interface), EP0 packet size 64, and string indices
/// 1/2/3 for manufacturer, product and serial.
pub fn device_descriptor_bytes(vendor_id: u16, product_id: u16, usb_version: u16) -> Vec<u8> {
    device_descriptor_with_class(vendor_id, product_id, usb_version, 0x00)
}

pub fn device_descriptor_with_class(
    vendor_id: u16,
    product_id: u16,
    usb_version: u16,
    class: u8,
) -> Vec<u8> {
    let mut bytes = vec![0x12, 0x01];
    bytes.extend_from_slice(&usb_version.to_le_bytes());
    bytes.extend_from_slice(&[class, 0x00, 0x00, 0x40]);
    bytes.extend_from_slice(&vendor_id.to_le_bytes());
    bytes.extend_from_slice(&product_id.to_le_bytes());
    bytes.extend_from_slice(&0x0100u16.to_le_bytes());
    bytes.extend_from_slice(&[0x01, 0x02, 0x03, 0x01]);
    bytes
}

/// Incremental builder for configuration descriptor sets
///
/// `wTotalLength` and `bNumInterfaces` are filled in by [`ConfigBuilder::build`];
/// each interface's `bNumEndpoints` counts the endpoints added after it.
pub struct ConfigBuilder {
    value: u8,
    attributes: u8,
    body: Vec<u8>,
    interface_numbers: Vec<u8>,
    /// Offset of the last interface descriptor in `body`
    current_interface: Option<usize>,
}

impl ConfigBuilder {
    pub fn new(value: u8) -> Self {
        Self {
            value,
            attributes: 0x80,
            body: Vec::new(),
            interface_numbers: Vec::new(),
            current_interface: None,
        }
    }

    pub fn self_powered(mut self) -> Self {
        self.attributes |= 0x40;
        self
    }

    pub fn interface(self, number: u8, alt_setting: u8, class: u8) -> Self {
        self.interface_with_subclass(number, alt_setting, class, 0x00)
    }

    pub fn interface_with_subclass(
        mut self,
        number: u8,
        alt_setting: u8,
        class: u8,
        subclass: u8,
    ) -> Self {
        if !self.interface_numbers.contains(&number) {
            self.interface_numbers.push(number);
        }
        self.current_interface = Some(self.body.len());
        self.body
            .extend_from_slice(&[0x09, 0x04, number, alt_setting, 0x00, class, subclass, 0x00, 0x00]);
        self
    }

    pub fn endpoint(mut self, address: u8, attributes: u8, max_packet_size: u16) -> Self {
        if let Some(offset) = self.current_interface {
            self.body[offset + 4] += 1;
        }
        self.body.extend_from_slice(&[0x07, 0x05, address, attributes]);
        self.body.extend_from_slice(&max_packet_size.to_le_bytes());
        self.body.push(0x01);
        self
    }

    /// Append a raw (class or vendor specific) descriptor
    pub fn raw(mut self, descriptor: &[u8]) -> Self {
        self.body.extend_from_slice(descriptor);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total = (9 + self.body.len()) as u16;
        let mut bytes = vec![0x09, 0x02];
        bytes.extend_from_slice(&total.to_le_bytes());
        bytes.extend_from_slice(&[
            self.interface_numbers.len() as u8,
            self.value,
            0x00,
            self.attributes,
            0x32,
        ]);
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Camera-like configuration: video control with a camera terminal and a
/// processing unit, plus a video streaming interface with a bulk endpoint
pub fn uvc_camera_config() -> Vec<u8> {
    ConfigBuilder::new(1)
        .raw(&[0x08, 0x0B, 0x00, 0x02, 0x0E, 0x03, 0x00, 0x00])
        .interface_with_subclass(0, 0, 0x0E, 0x01)
        .raw(&[0x0D, 0x24, 0x01, 0x00, 0x01, 0x33, 0x00, 0x00, 0x6C, 0xDC, 0x02, 0x01, 0x01])
        .raw(&[
            0x12, 0x24, 0x02, 0x01, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x03, 0x0E, 0x00, 0x00,
        ])
        .raw(&[0x0B, 0x24, 0x05, 0x02, 0x01, 0x00, 0x40, 0x02, 0x7F, 0x17, 0x00])
        .endpoint(0x83, 0x03, 16)
        .interface_with_subclass(1, 0, 0x0E, 0x02)
        .endpoint(0x81, 0x02, 512)
        .build()
}

/// Run a future with a timeout
///
/// # Example
/// ```
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// # tokio_test();
/// # fn tokio_test() {
/// # let rt = tokio::runtime::Runtime::new().unwrap();
/// # rt.block_on(async {
/// let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
/// assert_eq!(result.unwrap(), 42);
/// # });
/// # }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
