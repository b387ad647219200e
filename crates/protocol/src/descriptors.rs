//! Standard descriptor decoding
//!
//! Turns raw descriptor bytes into an immutable tree:
//! device -> configurations -> interfaces (alternate settings) -> endpoints.
//!
//! Every descriptor starts with `bLength` and `bDescriptorType`. Anything
//! found between the fixed part of a standard descriptor and the next
//! standard descriptor (class or vendor specific descriptors) is kept verbatim
//! in the `extra` field of the enclosing configuration, alternate setting or
//! endpoint. All multi-byte fields are little-endian and are converted
//! explicitly, independent of host byte order.

use crate::error::DescriptorError;
use crate::setup::Direction;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Descriptor type codes
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
    pub const BOS: u8 = 0x0F;
    pub const CS_INTERFACE: u8 = 0x24;
    pub const CS_ENDPOINT: u8 = 0x25;
}

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
pub const CONFIG_DESCRIPTOR_LEN: usize = 9;
pub const INTERFACE_DESCRIPTOR_LEN: usize = 9;
pub const ENDPOINT_DESCRIPTOR_LEN: usize = 7;
/// Audio class endpoints carry bRefresh and bSynchAddress
pub const AUDIO_ENDPOINT_DESCRIPTOR_LEN: usize = 9;

/// Device descriptor (USB 2.0 table 9-8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// bcdUSB
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Decode the fixed 18-byte layout
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let raw = frame_at(bytes, 0)?.ok_or(DescriptorError::Truncated {
            offset: 0,
            declared: DEVICE_DESCRIPTOR_LEN,
            remaining: bytes.len(),
        })?;
        expect_type(raw, 0, descriptor_type::DEVICE)?;
        expect_len(raw, 0, DEVICE_DESCRIPTOR_LEN)?;

        Ok(Self {
            length: raw[0],
            descriptor_type: raw[1],
            usb_version: LittleEndian::read_u16(&raw[2..4]),
            class: raw[4],
            subclass: raw[5],
            protocol: raw[6],
            max_packet_size0: raw[7],
            vendor_id: LittleEndian::read_u16(&raw[8..10]),
            product_id: LittleEndian::read_u16(&raw[10..12]),
            device_version: LittleEndian::read_u16(&raw[12..14]),
            manufacturer_index: raw[14],
            product_index: raw[15],
            serial_number_index: raw[16],
            num_configurations: raw[17],
        })
    }

    /// Encode back to the 18-byte wire layout
    pub fn to_bytes(&self) -> [u8; DEVICE_DESCRIPTOR_LEN] {
        let mut out = [0u8; DEVICE_DESCRIPTOR_LEN];
        out[0] = self.length;
        out[1] = self.descriptor_type;
        LittleEndian::write_u16(&mut out[2..4], self.usb_version);
        out[4] = self.class;
        out[5] = self.subclass;
        out[6] = self.protocol;
        out[7] = self.max_packet_size0;
        LittleEndian::write_u16(&mut out[8..10], self.vendor_id);
        LittleEndian::write_u16(&mut out[10..12], self.product_id);
        LittleEndian::write_u16(&mut out[12..14], self.device_version);
        out[14] = self.manufacturer_index;
        out[15] = self.product_index;
        out[16] = self.serial_number_index;
        out[17] = self.num_configurations;
        out
    }

    pub fn manufacturer_string_index(&self) -> Option<u8> {
        non_zero(self.manufacturer_index)
    }

    pub fn product_string_index(&self) -> Option<u8> {
        non_zero(self.product_index)
    }

    pub fn serial_number_string_index(&self) -> Option<u8> {
        non_zero(self.serial_number_index)
    }
}

/// Configuration descriptor with its interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    /// bMaxPower in device units (2 mA for USB 2.0)
    pub max_power: u8,
    pub interfaces: Vec<Interface>,
    pub extra: Vec<u8>,
}

impl ConfigDescriptor {
    pub fn self_powered(&self) -> bool {
        self.attributes & 0x40 != 0
    }

    pub fn remote_wakeup(&self) -> bool {
        self.attributes & 0x20 != 0
    }

    /// Iterate over every alternate setting of every interface
    pub fn alt_settings(&self) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.interfaces.iter().flat_map(|i| i.alt_settings.iter())
    }
}

/// One interface number and all of its alternate settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub number: u8,
    pub alt_settings: Vec<InterfaceDescriptor>,
}

/// Interface descriptor (one alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub interface_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
    pub extra: Vec<u8>,
}

/// Transfer type from bits 1..0 of bmAttributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointTransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Audio endpoints only
    pub refresh: u8,
    /// Audio endpoints only
    pub synch_address: u8,
    pub extra: Vec<u8>,
}

impl EndpointDescriptor {
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn transfer_type(&self) -> EndpointTransferType {
        match self.attributes & 0x03 {
            0 => EndpointTransferType::Control,
            1 => EndpointTransferType::Isochronous,
            2 => EndpointTransferType::Bulk,
            _ => EndpointTransferType::Interrupt,
        }
    }
}

/// Decode a full configuration descriptor (as returned for GET_DESCRIPTOR(CONFIGURATION))
///
/// Any framing violation fails the whole configuration; sibling
/// configurations are decoded from their own buffers and are unaffected.
pub fn parse_config(bytes: &[u8]) -> Result<ConfigDescriptor, DescriptorError> {
    let header = frame_at(bytes, 0)?.ok_or(DescriptorError::Truncated {
        offset: 0,
        declared: CONFIG_DESCRIPTOR_LEN,
        remaining: bytes.len(),
    })?;
    expect_type(header, 0, descriptor_type::CONFIGURATION)?;
    expect_len(header, 0, CONFIG_DESCRIPTOR_LEN)?;

    let total_length = LittleEndian::read_u16(&header[2..4]);
    if usize::from(total_length) < header.len() {
        return Err(DescriptorError::InvalidLength {
            offset: 0,
            length: header[0],
        });
    }

    // A short read leaves a partial descriptor set; decode what is present.
    let end = usize::from(total_length).min(bytes.len());
    let mut cursor = Cursor::new(&bytes[..end], header.len());

    let num_interfaces = header[4];
    let extra = cursor.take_extra()?;

    let mut interfaces = Vec::with_capacity(usize::from(num_interfaces));
    for found in 0..num_interfaces {
        if cursor.at_end() {
            return Err(DescriptorError::MissingInterface {
                expected: num_interfaces,
                found,
            });
        }
        interfaces.push(parse_interface(&mut cursor)?);
    }

    Ok(ConfigDescriptor {
        length: header[0],
        descriptor_type: header[1],
        total_length,
        num_interfaces,
        configuration_value: header[5],
        configuration_index: header[6],
        attributes: header[7],
        max_power: header[8],
        interfaces,
        extra,
    })
}

fn parse_interface(cursor: &mut Cursor<'_>) -> Result<Interface, DescriptorError> {
    let first = parse_alt_setting(cursor)?;
    let number = first.interface_number;
    let mut alt_settings = vec![first];

    while cursor.next_is_interface(number) {
        alt_settings.push(parse_alt_setting(cursor)?);
    }

    Ok(Interface {
        number,
        alt_settings,
    })
}

fn parse_alt_setting(cursor: &mut Cursor<'_>) -> Result<InterfaceDescriptor, DescriptorError> {
    let offset = cursor.pos;
    let raw = cursor.take()?;
    expect_type(raw, offset, descriptor_type::INTERFACE)?;
    expect_len(raw, offset, INTERFACE_DESCRIPTOR_LEN)?;

    let num_endpoints = raw[4];
    let extra = cursor.take_extra()?;

    let mut endpoints = Vec::with_capacity(usize::from(num_endpoints));
    for _ in 0..num_endpoints {
        if cursor.at_end() {
            return Err(DescriptorError::Truncated {
                offset: cursor.pos,
                declared: ENDPOINT_DESCRIPTOR_LEN,
                remaining: cursor.remaining(),
            });
        }
        endpoints.push(parse_endpoint(cursor)?);
    }

    Ok(InterfaceDescriptor {
        length: raw[0],
        descriptor_type: raw[1],
        interface_number: raw[2],
        alternate_setting: raw[3],
        num_endpoints,
        class: raw[5],
        subclass: raw[6],
        protocol: raw[7],
        interface_index: raw[8],
        endpoints,
        extra,
    })
}

fn parse_endpoint(cursor: &mut Cursor<'_>) -> Result<EndpointDescriptor, DescriptorError> {
    let offset = cursor.pos;
    let raw = cursor.take()?;
    expect_type(raw, offset, descriptor_type::ENDPOINT)?;
    expect_len(raw, offset, ENDPOINT_DESCRIPTOR_LEN)?;

    let (refresh, synch_address) = if raw.len() >= AUDIO_ENDPOINT_DESCRIPTOR_LEN {
        (raw[7], raw[8])
    } else {
        (0, 0)
    };
    let extra = cursor.take_extra()?;

    Ok(EndpointDescriptor {
        length: raw[0],
        descriptor_type: raw[1],
        address: raw[2],
        attributes: raw[3],
        max_packet_size: LittleEndian::read_u16(&raw[4..6]),
        interval: raw[6],
        refresh,
        synch_address,
        extra,
    })
}

/// Iterator over a run of self-describing descriptors
///
/// Yields each descriptor's full byte slice. After the first framing error
/// the error is yielded once and iteration ends.
pub struct DescriptorIter<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }

    /// Offset of the next descriptor
    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<&'a [u8], DescriptorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match frame_at(self.buf, self.pos) {
            Ok(Some(raw)) => {
                self.pos += raw.len();
                Some(Ok(raw))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Walks a configuration buffer, one descriptor at a time
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Fewer than two bytes left means no further descriptor header
    fn at_end(&self) -> bool {
        self.remaining() < 2
    }

    fn peek_type(&self) -> Option<u8> {
        if self.at_end() {
            None
        } else {
            Some(self.buf[self.pos + 1])
        }
    }

    fn next_is_interface(&self, number: u8) -> bool {
        self.peek_type() == Some(descriptor_type::INTERFACE)
            && self.remaining() > 2
            && self.buf[self.pos + 2] == number
    }

    fn take(&mut self) -> Result<&'a [u8], DescriptorError> {
        let raw = frame_at(self.buf, self.pos)?.ok_or(DescriptorError::Truncated {
            offset: self.pos,
            declared: 2,
            remaining: self.remaining(),
        })?;
        self.pos += raw.len();
        Ok(raw)
    }

    /// Collect class/vendor descriptors up to the next standard descriptor
    fn take_extra(&mut self) -> Result<Vec<u8>, DescriptorError> {
        let start = self.pos;
        while let Some(kind) = self.peek_type() {
            if is_standard_boundary(kind) {
                break;
            }
            self.take()?;
        }
        Ok(self.buf[start..self.pos].to_vec())
    }
}

fn is_standard_boundary(kind: u8) -> bool {
    matches!(
        kind,
        descriptor_type::DEVICE
            | descriptor_type::CONFIGURATION
            | descriptor_type::INTERFACE
            | descriptor_type::ENDPOINT
    )
}

/// Frame the descriptor starting at `offset`
///
/// `Ok(None)` when fewer than two bytes remain. A `bLength` below 2 or beyond
/// the end of the buffer is a framing error.
fn frame_at(buf: &[u8], offset: usize) -> Result<Option<&[u8]>, DescriptorError> {
    let remaining = buf.len().saturating_sub(offset);
    if remaining < 2 {
        return Ok(None);
    }
    let length = buf[offset];
    if length < 2 {
        return Err(DescriptorError::InvalidLength { offset, length });
    }
    let declared = usize::from(length);
    if declared > remaining {
        return Err(DescriptorError::Truncated {
            offset,
            declared,
            remaining,
        });
    }
    Ok(Some(&buf[offset..offset + declared]))
}

fn expect_type(raw: &[u8], offset: usize, expected: u8) -> Result<(), DescriptorError> {
    if raw[1] != expected {
        return Err(DescriptorError::UnexpectedType {
            offset,
            expected,
            found: raw[1],
        });
    }
    Ok(())
}

fn expect_len(raw: &[u8], offset: usize, min: usize) -> Result<(), DescriptorError> {
    if raw.len() < min {
        return Err(DescriptorError::InvalidLength {
            offset,
            length: raw[0],
        });
    }
    Ok(())
}

fn non_zero(index: u8) -> Option<u8> {
    if index == 0 { None } else { Some(index) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: [u8; 18] = [
        0x12, 0x01, 0x00, 0x02, 0xEF, 0x02, 0x01, 0x40, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0x01,
        0x02, 0x03, 0x01,
    ];

    #[test]
    fn test_parse_device_descriptor() {
        let desc = DeviceDescriptor::parse(&DEVICE).unwrap();
        assert_eq!(desc.usb_version, 0x0200);
        assert_eq!(desc.class, 0xEF);
        assert_eq!(desc.vendor_id, 0x1234);
        assert_eq!(desc.product_id, 0x5678);
        assert_eq!(desc.device_version, 0x0100);
        assert_eq!(desc.manufacturer_string_index(), Some(1));
        assert_eq!(desc.num_configurations, 1);
        assert_eq!(desc.to_bytes(), DEVICE);
    }

    #[test]
    fn test_device_descriptor_too_short() {
        let err = DeviceDescriptor::parse(&DEVICE[..10]).unwrap_err();
        assert_eq!(
            err,
            DescriptorError::Truncated {
                offset: 0,
                declared: 18,
                remaining: 10
            }
        );
    }

    #[test]
    fn test_device_descriptor_wrong_type() {
        let mut bytes = DEVICE;
        bytes[1] = 0x02;
        assert!(matches!(
            DeviceDescriptor::parse(&bytes),
            Err(DescriptorError::UnexpectedType { expected: 1, .. })
        ));
    }

    fn hid_config() -> Vec<u8> {
        let mut bytes = vec![
            // configuration
            0x09, 0x02, 0x00, 0x00, 0x01, 0x01, 0x00, 0xA0, 0x32, //
            // interface 0 alt 0, one endpoint, HID
            0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00, //
            // HID class descriptor (extra)
            0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3F, 0x00, //
            // endpoint 0x81 interrupt, 8 bytes, 10ms
            0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A,
        ];
        let total = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&total.to_le_bytes());
        bytes
    }

    #[test]
    fn test_parse_hid_config() {
        let config = parse_config(&hid_config()).unwrap();
        assert_eq!(config.total_length, 34);
        assert_eq!(config.num_interfaces, 1);
        assert!(config.remote_wakeup());
        assert!(!config.self_powered());
        assert!(config.extra.is_empty());

        let alt = &config.interfaces[0].alt_settings[0];
        assert_eq!(alt.class, 0x03);
        assert_eq!(alt.extra.len(), 9);
        assert_eq!(alt.extra[1], 0x21);

        let ep = &alt.endpoints[0];
        assert_eq!(ep.address, 0x81);
        assert_eq!(ep.number(), 1);
        assert_eq!(ep.direction(), Direction::In);
        assert_eq!(ep.transfer_type(), EndpointTransferType::Interrupt);
        assert_eq!(ep.max_packet_size, 8);
    }

    #[test]
    fn test_extra_descriptor_overrunning_buffer() {
        let mut bytes = hid_config();
        // HID descriptor claims 0x30 bytes
        bytes[18] = 0x30;
        let err = parse_config(&bytes).unwrap_err();
        assert!(matches!(err, DescriptorError::Truncated { offset: 18, .. }));
    }

    #[test]
    fn test_zero_length_descriptor_is_rejected() {
        let mut bytes = hid_config();
        bytes[18] = 0x00;
        assert_eq!(
            parse_config(&bytes).unwrap_err(),
            DescriptorError::InvalidLength {
                offset: 18,
                length: 0
            }
        );
    }

    #[test]
    fn test_missing_interface() {
        let mut bytes = hid_config();
        bytes[4] = 2;
        assert_eq!(
            parse_config(&bytes).unwrap_err(),
            DescriptorError::MissingInterface {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_descriptor_iter_stops_after_error() {
        let bytes = [0x03, 0x24, 0x01, 0x05, 0x24, 0x02];
        let items: Vec<_> = DescriptorIter::new(&bytes).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }
}
