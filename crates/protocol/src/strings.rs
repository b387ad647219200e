//! String descriptor decoding

use crate::descriptors::descriptor_type;
use crate::error::DescriptorError;
use byteorder::{ByteOrder, LittleEndian};

/// US English, the language most devices answer in
pub const LANGUAGE_EN_US: u16 = 0x0409;

/// Maximum size of a string descriptor
pub const MAX_STRING_DESCRIPTOR_LEN: usize = 255;

/// Decode a UTF-16LE string descriptor
///
/// The payload starts at offset 2 and spans `bLength - 2` bytes. Unpaired
/// surrogates are replaced with U+FFFD; a trailing odd byte is ignored.
pub fn decode_string_descriptor(bytes: &[u8]) -> Result<String, DescriptorError> {
    let payload = string_payload(bytes)?;
    let units = payload
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect::<Vec<_>>();

    Ok(char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

/// Decode string descriptor zero, the list of supported LANGIDs
pub fn decode_language_ids(bytes: &[u8]) -> Result<Vec<u16>, DescriptorError> {
    let payload = string_payload(bytes)?;
    Ok(payload.chunks_exact(2).map(LittleEndian::read_u16).collect())
}

/// Copy an ASCII string returned by the native layer
///
/// Only the first `count` bytes are meaningful; `count` is clamped to the
/// buffer. Bytes outside the ASCII range become `?`.
pub fn ascii_from_raw(buf: &[u8], count: usize) -> String {
    buf[..count.min(buf.len())]
        .iter()
        .map(|&b| if b.is_ascii() { char::from(b) } else { '?' })
        .collect()
}

fn string_payload(bytes: &[u8]) -> Result<&[u8], DescriptorError> {
    if bytes.len() < 2 {
        return Err(DescriptorError::Truncated {
            offset: 0,
            declared: 2,
            remaining: bytes.len(),
        });
    }

    let length = bytes[0];
    if length < 2 {
        return Err(DescriptorError::InvalidLength { offset: 0, length });
    }
    if bytes[1] != descriptor_type::STRING {
        return Err(DescriptorError::UnexpectedType {
            offset: 0,
            expected: descriptor_type::STRING,
            found: bytes[1],
        });
    }
    if usize::from(length) > bytes.len() {
        return Err(DescriptorError::Truncated {
            offset: 0,
            declared: usize::from(length),
            remaining: bytes.len(),
        });
    }

    Ok(&bytes[2..usize::from(length)])
}

/// Encode `text` as a UTF-16LE string descriptor, truncating to 255 bytes
pub fn encode_string_descriptor(text: &str) -> Vec<u8> {
    let mut out = vec![0u8, descriptor_type::STRING];
    for unit in text.encode_utf16() {
        if out.len() + 2 > MAX_STRING_DESCRIPTOR_LEN {
            break;
        }
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf16() {
        let bytes = [0x0A, 0x03, b'A', 0, b'c', 0, b'm', 0, b'e', 0];
        assert_eq!(decode_string_descriptor(&bytes).unwrap(), "Acme");
    }

    #[test]
    fn test_decode_honours_blength() {
        // Buffer longer than bLength: trailing bytes are ignored
        let bytes = [0x06, 0x03, b'H', 0, b'i', 0, b'X', 0];
        assert_eq!(decode_string_descriptor(&bytes).unwrap(), "Hi");
    }

    #[test]
    fn test_decode_non_ascii() {
        let encoded = encode_string_descriptor("Käse µ");
        assert_eq!(decode_string_descriptor(&encoded).unwrap(), "Käse µ");
    }

    #[test]
    fn test_truncated_string() {
        let bytes = [0x0A, 0x03, b'A', 0];
        assert!(matches!(
            decode_string_descriptor(&bytes),
            Err(DescriptorError::Truncated { declared: 10, .. })
        ));
    }

    #[test]
    fn test_language_ids() {
        let bytes = [0x06, 0x03, 0x09, 0x04, 0x07, 0x04];
        assert_eq!(decode_language_ids(&bytes).unwrap(), vec![0x0409, 0x0407]);
    }

    #[test]
    fn test_ascii_from_raw() {
        let buf = *b"Serial\xff\0\0\0";
        assert_eq!(ascii_from_raw(&buf, 7), "Serial?");
        assert_eq!(ascii_from_raw(&buf, 100).len(), buf.len());
    }

    #[test]
    fn test_encode_truncates() {
        let long = "x".repeat(300);
        let encoded = encode_string_descriptor(&long);
        assert!(encoded.len() <= MAX_STRING_DESCRIPTOR_LEN);
        assert_eq!(usize::from(encoded[0]), encoded.len());
    }
}
