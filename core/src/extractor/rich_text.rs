//! Plain text recovery from the archived attributed-string column.
//!
//! Newer OS versions leave `message.text` empty and only store the body inside a
//! `streamtyped` archive of an `NSAttributedString`. The string payload follows the
//! `NSString` class marker as `+ <length> <utf8 bytes>`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RichTextError {
    #[error("no string marker in archive")]
    MissingMarker,
    #[error("archive truncated")]
    Truncated,
    #[error("unsupported length prefix 0x{0:02x}")]
    UnsupportedLength(u8),
    #[error("string payload is not utf-8")]
    InvalidUtf8,
}

const MARKERS: [&[u8]; 2] = [b"NSMutableString", b"NSString"];
const STRING_TAG: u8 = b'+';
const MAX_TAG_DISTANCE: usize = 16;

pub fn extract_text(blob: &[u8]) -> Result<String, RichTextError> {
    let marker_end = MARKERS
        .iter()
        .filter_map(|marker| find(blob, marker).map(|idx| idx + marker.len()))
        .min()
        .ok_or(RichTextError::MissingMarker)?;

    let window_end = (marker_end + MAX_TAG_DISTANCE).min(blob.len());
    let tag_offset = blob[marker_end..window_end]
        .iter()
        .position(|b| *b == STRING_TAG)
        .ok_or(RichTextError::Truncated)?;
    let mut cursor = marker_end + tag_offset + 1;

    let prefix = *blob.get(cursor).ok_or(RichTextError::Truncated)?;
    cursor += 1;
    let len = match prefix {
        0x81 => {
            let bytes = blob.get(cursor..cursor + 2).ok_or(RichTextError::Truncated)?;
            cursor += 2;
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize
        }
        0x82 => {
            let bytes = blob.get(cursor..cursor + 4).ok_or(RichTextError::Truncated)?;
            cursor += 4;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        }
        b if b < 0x80 => b as usize,
        other => return Err(RichTextError::UnsupportedLength(other)),
    };

    let payload = blob.get(cursor..cursor + len).ok_or(RichTextError::Truncated)?;
    String::from_utf8(payload.to_vec()).map_err(|_| RichTextError::InvalidUtf8)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Builds an archive in the same shape the message store writes. Used by fixtures.
pub fn encode_text(text: &str) -> Vec<u8> {
    let mut blob = Vec::with_capacity(text.len() + 96);
    blob.extend_from_slice(b"\x04\x0bstreamtyped\x81\xe8\x03\x84\x01@\x84\x84\x84");
    blob.extend_from_slice(b"\x12NSAttributedString\x00\x84\x84\x08NSObject\x00\x85\x92\x84\x84\x84");
    blob.extend_from_slice(b"\x08NSString\x01\x94\x84\x01+");
    let bytes = text.as_bytes();
    if bytes.len() < 0x80 {
        blob.push(bytes.len() as u8);
    } else if bytes.len() <= u16::MAX as usize {
        blob.push(0x81);
        blob.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    } else {
        blob.push(0x82);
        blob.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    }
    blob.extend_from_slice(bytes);
    blob.extend_from_slice(b"\x86\x84\x02iI\x01\x01\x92\x84\x84\x84\x0cNSDictionary\x00");
    blob
}
