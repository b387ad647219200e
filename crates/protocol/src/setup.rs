//! Control transfer setup packets
//!
//! Builds the 8-byte header that precedes every control transfer:
//!
//! ```text
//! byte 0      bmRequestType  (bit 7 direction, bits 6..5 type, bits 4..0 recipient)
//! byte 1      bRequest
//! bytes 2..4  wValue   (little-endian)
//! bytes 4..6  wIndex   (little-endian)
//! bytes 6..8  wLength  (little-endian)
//! ```

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Size of a setup packet on the wire
pub const SETUP_PACKET_LEN: usize = 8;

/// Data stage direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out = 0,
    /// Device to host
    In = 1,
}

/// Request type field of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Recipient field of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Standard request codes (USB 2.0 table 9-4)
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
    pub const SYNCH_FRAME: u8 = 0x0C;
}

/// Feature selector for halting an endpoint
pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

/// Pack direction, type and recipient into bmRequestType
pub const fn request_type(direction: Direction, kind: RequestType, recipient: Recipient) -> u8 {
    ((direction as u8) << 7) | ((kind as u8) << 5) | (recipient as u8)
}

/// Decoded setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSetup {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl ControlSetup {
    pub fn new(
        direction: Direction,
        kind: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: request_type(direction, kind, recipient),
            request,
            value,
            index,
            length,
        }
    }

    /// Build from an already packed bmRequestType
    pub fn from_raw(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0x03 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    /// Recipient, or `None` for the reserved encodings 4..=31
    pub fn recipient(&self) -> Option<Recipient> {
        match self.request_type & 0x1f {
            0 => Some(Recipient::Device),
            1 => Some(Recipient::Interface),
            2 => Some(Recipient::Endpoint),
            3 => Some(Recipient::Other),
            _ => None,
        }
    }

    /// Encode to the 8-byte wire format
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let mut out = [0u8; SETUP_PACKET_LEN];
        out[0] = self.request_type;
        out[1] = self.request;
        LittleEndian::write_u16(&mut out[2..4], self.value);
        LittleEndian::write_u16(&mut out[4..6], self.index);
        LittleEndian::write_u16(&mut out[6..8], self.length);
        out
    }

    /// Decode from the 8-byte wire format
    pub fn from_bytes(bytes: &[u8; SETUP_PACKET_LEN]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        }
    }

    /// GET_DESCRIPTOR for `descriptor_type`/`index`, `language` in wIndex
    pub fn get_descriptor(descriptor_type: u8, index: u8, language: u16, length: u16) -> Self {
        Self::new(
            Direction::In,
            RequestType::Standard,
            Recipient::Device,
            request::GET_DESCRIPTOR,
            (u16::from(descriptor_type) << 8) | u16::from(index),
            language,
            length,
        )
    }

    pub fn get_status(recipient: Recipient, index: u16) -> Self {
        Self::new(
            Direction::In,
            RequestType::Standard,
            recipient,
            request::GET_STATUS,
            0,
            index,
            2,
        )
    }

    pub fn get_configuration() -> Self {
        Self::new(
            Direction::In,
            RequestType::Standard,
            Recipient::Device,
            request::GET_CONFIGURATION,
            0,
            0,
            1,
        )
    }

    pub fn set_configuration(value: u8) -> Self {
        Self::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Device,
            request::SET_CONFIGURATION,
            u16::from(value),
            0,
            0,
        )
    }

    pub fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Interface,
            request::SET_INTERFACE,
            u16::from(alternate_setting),
            u16::from(interface),
            0,
        )
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) for `endpoint`
    pub fn clear_halt(endpoint: u8) -> Self {
        Self::new(
            Direction::Out,
            RequestType::Standard,
            Recipient::Endpoint,
            request::CLEAR_FEATURE,
            FEATURE_ENDPOINT_HALT,
            u16::from(endpoint),
            0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_bits() {
        assert_eq!(
            request_type(Direction::In, RequestType::Standard, Recipient::Device),
            0x80
        );
        assert_eq!(
            request_type(Direction::Out, RequestType::Class, Recipient::Interface),
            0x21
        );
        assert_eq!(
            request_type(Direction::In, RequestType::Vendor, Recipient::Endpoint),
            0xC2
        );
        assert_eq!(
            request_type(Direction::Out, RequestType::Standard, Recipient::Other),
            0x03
        );
    }

    #[test]
    fn test_get_device_descriptor_bytes() {
        let setup = ControlSetup::new(
            Direction::In,
            RequestType::Standard,
            Recipient::Device,
            request::GET_DESCRIPTOR,
            0x01 << 8,
            0,
            18,
        );
        assert_eq!(
            setup.to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
        assert_eq!(ControlSetup::get_descriptor(0x01, 0, 0, 18), setup);
    }

    #[test]
    fn test_field_accessors() {
        let setup = ControlSetup::from_raw(0xA1, 0x81, 0x0200, 0x0300, 4);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.kind(), RequestType::Class);
        assert_eq!(setup.recipient(), Some(Recipient::Interface));

        let reserved = ControlSetup::from_raw(0x1f, 0, 0, 0, 0);
        assert_eq!(reserved.recipient(), None);
    }

    #[test]
    fn test_from_bytes() {
        let bytes = [0x02, 0x01, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00];
        let setup = ControlSetup::from_bytes(&bytes);
        assert_eq!(setup, ControlSetup::clear_halt(0x81));
        assert_eq!(setup.to_bytes(), bytes);
    }

    #[test]
    fn test_set_interface_layout() {
        let bytes = ControlSetup::set_interface(2, 1).to_bytes();
        assert_eq!(bytes, [0x01, 0x0B, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00]);
    }
}
