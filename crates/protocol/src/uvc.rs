//! USB Video Class helpers
//!
//! Locates the units and terminals of a video control interface by walking the
//! class-specific descriptors kept in the interface's extra bytes, and builds
//! the class requests used to read and write their controls. Streaming is out
//! of scope here.

use crate::descriptors::{ConfigDescriptor, InterfaceDescriptor, descriptor_type};
use crate::setup::{ControlSetup, Direction, Recipient, RequestType};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

pub const CLASS_VIDEO: u8 = 0x0E;
pub const SUBCLASS_VIDEO_CONTROL: u8 = 0x01;
pub const SUBCLASS_VIDEO_STREAMING: u8 = 0x02;

/// Video control interface descriptor subtypes
pub mod vc_subtype {
    pub const HEADER: u8 = 0x01;
    pub const INPUT_TERMINAL: u8 = 0x02;
    pub const OUTPUT_TERMINAL: u8 = 0x03;
    pub const SELECTOR_UNIT: u8 = 0x04;
    pub const PROCESSING_UNIT: u8 = 0x05;
    pub const EXTENSION_UNIT: u8 = 0x06;
    pub const ENCODING_UNIT: u8 = 0x07;
}

/// wTerminalType of a camera sensor input terminal
pub const ITT_CAMERA: u16 = 0x0201;

/// Class-specific request codes (UVC 1.5 table A-8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum UvcRequest {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

impl UvcRequest {
    pub fn direction(self) -> Direction {
        if (self as u8) & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// An input terminal found in the video control interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTerminal {
    pub terminal_id: u8,
    pub terminal_type: u16,
}

/// An extension unit with its vendor GUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionUnit {
    pub unit_id: u8,
    pub guid: [u8; 16],
}

/// Units and terminals discovered in a video control interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoControlUnits {
    /// Terminal ID of the first input terminal of type [`ITT_CAMERA`]
    pub camera_terminal_id: Option<u8>,
    /// Unit ID of the first processing unit
    pub processing_unit_id: Option<u8>,
    pub input_terminals: Vec<InputTerminal>,
    pub output_terminal_ids: Vec<u8>,
    pub selector_unit_ids: Vec<u8>,
    pub extension_units: Vec<ExtensionUnit>,
}

/// First video control interface of a configuration
pub fn find_video_control(config: &ConfigDescriptor) -> Option<&InterfaceDescriptor> {
    config
        .alt_settings()
        .find(|alt| alt.class == CLASS_VIDEO && alt.subclass == SUBCLASS_VIDEO_CONTROL)
}

/// Scan class-specific descriptors of a video control interface
///
/// Stops at the first descriptor with `bLength < 3` or one that runs past the
/// end of `extra`; whatever was found before that point is returned. Entries
/// too short for the field being read are skipped.
pub fn scan_video_control(extra: &[u8]) -> VideoControlUnits {
    let mut units = VideoControlUnits::default();
    let mut offset = 0;

    while extra.len() - offset >= 3 {
        let length = usize::from(extra[offset]);
        if length < 3 || length > extra.len() - offset {
            break;
        }
        let raw = &extra[offset..offset + length];
        offset += length;

        if raw[1] != descriptor_type::CS_INTERFACE {
            continue;
        }

        match raw[2] {
            vc_subtype::INPUT_TERMINAL if raw.len() >= 6 => {
                let terminal = InputTerminal {
                    terminal_id: raw[3],
                    terminal_type: LittleEndian::read_u16(&raw[4..6]),
                };
                if terminal.terminal_type == ITT_CAMERA && units.camera_terminal_id.is_none() {
                    units.camera_terminal_id = Some(terminal.terminal_id);
                }
                units.input_terminals.push(terminal);
            }
            vc_subtype::OUTPUT_TERMINAL if raw.len() >= 4 => {
                units.output_terminal_ids.push(raw[3]);
            }
            vc_subtype::SELECTOR_UNIT if raw.len() >= 4 => {
                units.selector_unit_ids.push(raw[3]);
            }
            vc_subtype::PROCESSING_UNIT if raw.len() >= 4 => {
                if units.processing_unit_id.is_none() {
                    units.processing_unit_id = Some(raw[3]);
                }
            }
            vc_subtype::EXTENSION_UNIT if raw.len() >= 20 => {
                let mut guid = [0u8; 16];
                guid.copy_from_slice(&raw[4..20]);
                units.extension_units.push(ExtensionUnit {
                    unit_id: raw[3],
                    guid,
                });
            }
            _ => {}
        }
    }

    units
}

/// Build a UVC control request addressed to `unit_id` on `interface`
///
/// wValue carries the control selector in its high byte; wIndex packs the
/// unit (or terminal) ID in the high byte and the interface number in the low
/// byte.
pub fn uvc_request(
    request: UvcRequest,
    selector: u8,
    unit_id: u8,
    interface: u8,
    length: u16,
) -> ControlSetup {
    ControlSetup::new(
        request.direction(),
        RequestType::Class,
        Recipient::Interface,
        request as u8,
        u16::from(selector) << 8,
        (u16::from(unit_id) << 8) | u16::from(interface),
        length,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_extra() -> Vec<u8> {
        vec![
            // VC header
            0x0D, 0x24, 0x01, 0x00, 0x01, 0x33, 0x00, 0x00, 0x6C, 0xDC, 0x02, 0x01, 0x01,
            // camera input terminal, ID 1
            0x12, 0x24, 0x02, 0x01, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x03, 0x0E, 0x00, 0x00, //
            // processing unit, ID 2
            0x0B, 0x24, 0x05, 0x02, 0x01, 0x00, 0x40, 0x02, 0x7F, 0x17, 0x00,
            // output terminal, ID 3
            0x09, 0x24, 0x03, 0x03, 0x01, 0x01, 0x00, 0x02, 0x00,
        ]
    }

    #[test]
    fn test_scan_camera() {
        let units = scan_video_control(&camera_extra());
        assert_eq!(units.camera_terminal_id, Some(1));
        assert_eq!(units.processing_unit_id, Some(2));
        assert_eq!(units.output_terminal_ids, vec![3]);
        assert_eq!(units.input_terminals.len(), 1);
        assert_eq!(units.input_terminals[0].terminal_type, ITT_CAMERA);
    }

    #[test]
    fn test_scan_stops_on_overrun() {
        let mut extra = camera_extra();
        // Processing unit claims more bytes than remain
        extra[31] = 0x40;
        let units = scan_video_control(&extra);
        assert_eq!(units.camera_terminal_id, Some(1));
        assert_eq!(units.processing_unit_id, None);
        assert!(units.output_terminal_ids.is_empty());
    }

    #[test]
    fn test_scan_stops_on_short_length() {
        let extra = [0x02, 0x24, 0x02, 0x01, 0x01, 0x02];
        assert_eq!(scan_video_control(&extra), VideoControlUnits::default());
    }

    #[test]
    fn test_non_camera_terminal() {
        // Composite connector input terminal (0x0401)
        let extra = [0x08, 0x24, 0x02, 0x05, 0x01, 0x04, 0x00, 0x00];
        let units = scan_video_control(&extra);
        assert_eq!(units.camera_terminal_id, None);
        assert_eq!(units.input_terminals[0].terminal_id, 5);
    }

    #[test]
    fn test_uvc_request_packing() {
        // GET_CUR of PU_BRIGHTNESS_CONTROL (0x02) on unit 2, interface 0
        let setup = uvc_request(UvcRequest::GetCur, 0x02, 2, 0, 2);
        assert_eq!(
            setup.to_bytes(),
            [0xA1, 0x81, 0x00, 0x02, 0x00, 0x02, 0x02, 0x00]
        );

        let setup = uvc_request(UvcRequest::SetCur, 0x02, 2, 1, 2);
        assert_eq!(setup.request_type, 0x21);
        assert_eq!(setup.index, 0x0201);
    }
}
