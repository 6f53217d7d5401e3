//! Fixed 21-byte message header
//!
//! ```text
//! offset  size  field
//! 0       16    delimiter (GUID 84da960a-54ec-47f5-a8b5-fa362221e8bf, little-endian fields)
//! 16      1     is_signed (any non-zero value means signed)
//! 17      4     payload_size (i32, little-endian)
//! ```

use bytes::{Buf, BufMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Size of the encoded header
pub const HEADER_SIZE: usize = 21;

/// Size of the delimiter
pub const DELIMITER_SIZE: usize = 16;

/// Delimiter bytes in wire order
pub const MESSAGE_DELIMITER: [u8; DELIMITER_SIZE] = [
    0x0a, 0x96, 0xda, 0x84, 0xec, 0x54, 0xf5, 0x47, 0xa8, 0xb5, 0xfa, 0x36, 0x22, 0x21, 0xe8, 0xbf,
];

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Whether the payload is a signed envelope
    pub is_signed: bool,
    /// Declared payload length; may be negative on a hostile stream
    pub payload_size: i32,
}

impl MessageHeader {
    /// Creates a header
    pub fn new(is_signed: bool, payload_size: i32) -> Self {
        Self {
            is_signed,
            payload_size,
        }
    }

    /// Encodes the header into its wire form
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_slice(&MESSAGE_DELIMITER);
        buf.put_u8(u8::from(self.is_signed));
        buf.put_i32_le(self.payload_size);
        out
    }

    /// Decodes a header, checking the delimiter
    ///
    /// # Errors
    ///
    /// Returns `ShortHeader` for fewer than 21 bytes and `BadDelimiter` on
    /// a delimiter mismatch.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortHeader(bytes.len()));
        }

        let mut buf = &bytes[..HEADER_SIZE];
        if buf[..DELIMITER_SIZE] != MESSAGE_DELIMITER {
            return Err(ProtocolError::BadDelimiter);
        }
        buf.advance(DELIMITER_SIZE);

        let is_signed = buf.get_u8() != 0;
        let payload_size = buf.get_i32_le();
        Ok(Self {
            is_signed,
            payload_size,
        })
    }

    /// Validates the declared size against `max` and returns it as a length
    ///
    /// # Errors
    ///
    /// Returns error for negative sizes or sizes above `max`.
    pub fn payload_len(&self, max: usize) -> ProtocolResult<usize> {
        if self.payload_size < 0 {
            return Err(ProtocolError::NegativePayloadSize(self.payload_size));
        }
        let size = self.payload_size as usize;
        if size > max {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload_size as i64,
                max,
            });
        }
        Ok(size)
    }
}
