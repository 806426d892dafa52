//! Pure framing and serialization functions.
//!
//! This module contains side-effect-free functions for finding frame
//! boundaries and serializing messages. All functions operate on byte
//! buffers and never perform I/O.

use super::types::ParseResult;
use crate::cursor::{Endianness, MAX_ARRAY_LENGTH, MAX_MESSAGE_LENGTH};
use crate::message::{frame_lengths, MIN_HEADER_LENGTH};
use crate::{Message, Result};

/// Find the first frame in a byte buffer.
///
/// The boundary is known from the first 16 bytes: the fixed preamble and
/// the byte length of the header field array. Only the endianness marker
/// and the length limits are checked here; everything else is left to
/// [`Message::parse`].
///
/// # Example
///
/// ```
/// use dbuslink::sansio::protocol::{parse_frame, serialize_message};
/// use dbuslink::sansio::types::ParseResult;
/// use dbuslink::Message;
///
/// let msg = Message::method_call("/", "Ping").build().unwrap();
/// let mut buf = serialize_message(&msg, 1).unwrap();
/// let len = buf.len();
/// buf.extend_from_slice(b"next frame");
/// match parse_frame(&buf) {
///     ParseResult::Complete { consumed, .. } => assert_eq!(consumed, len),
///     _ => panic!("Expected complete frame"),
/// }
/// ```
pub fn parse_frame(buf: &[u8]) -> ParseResult {
    if buf.len() < MIN_HEADER_LENGTH {
        return ParseResult::Incomplete {
            needed: MIN_HEADER_LENGTH - buf.len(),
        };
    }

    let endian = match Endianness::from_marker(buf[0]) {
        Some(endian) => endian,
        None => {
            return ParseResult::Invalid {
                error: format!("invalid endianness marker {:#04x}", buf[0]),
            }
        }
    };

    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[12..16]);
    let fields_len = endian.read_u32(word) as usize;
    if fields_len > MAX_ARRAY_LENGTH {
        return ParseResult::Invalid {
            error: format!("header field array of {} bytes", fields_len),
        };
    }

    let total = frame_lengths(endian, buf).total();
    if total > MAX_MESSAGE_LENGTH {
        return ParseResult::Invalid {
            error: format!(
                "message of {} bytes exceeds the maximum of {}",
                total, MAX_MESSAGE_LENGTH
            ),
        };
    }

    if buf.len() < total {
        return ParseResult::Incomplete {
            needed: total - buf.len(),
        };
    }

    ParseResult::Complete {
        message: buf[..total].to_vec(),
        consumed: total,
    }
}

/// Serialize a message for transmission under `serial`.
pub fn serialize_message(message: &Message, serial: u32) -> Result<Vec<u8>> {
    message.encode(serial)
}
