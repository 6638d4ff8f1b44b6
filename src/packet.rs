//! Wire-format definitions for measurement data packets.
//!
//! Every datagram on the data channel is a [`DataHead`] followed by padding
//! bytes that only exist to reach the command's requested packet size. This
//! module is responsible for:
//! - Defining the on-wire binary layout (13-byte header, little-endian).
//! - Serialising a header + pad length into a byte buffer ready to send.
//! - Deserialising a raw datagram back into a [`DataHead`], returning errors
//!   for truncated or inconsistent input.
//!
//! No I/O happens here — this is pure data transformation.

use thiserror::Error;

/// Size of the fixed header: 8 (timestamp) + 2 (sequence) + 2 (length) + 1 (token).
pub const HEADER_LEN: usize = 13;

/// Fixed-size data-packet header.
///
/// All multi-byte fields are little-endian on the wire, so heterogeneous
/// endpoints agree on the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHead {
    /// Sender wall-clock time in nanoseconds since the UNIX epoch.
    pub timestamp: i64,
    /// Packet sequence number (wraps).
    pub sequence: u16,
    /// Number of padding bytes following the header.
    pub length: u16,
    /// Token of the command this packet belongs to.
    pub token: u8,
}

impl DataHead {
    /// Serialise this header followed by `self.length` zero padding bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.length as usize];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..10].copy_from_slice(&self.sequence.to_le_bytes());
        buf[10..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12] = self.token;
        buf
    }

    /// Parse a [`DataHead`] from the front of a raw datagram.
    ///
    /// Returns `Err` if the buffer is shorter than the header, or if the
    /// declared padding length does not match the bytes that follow it.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort(buf.len()));
        }
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&buf[0..8]);
        let head = Self {
            timestamp: i64::from_le_bytes(timestamp),
            sequence: u16::from_le_bytes([buf[8], buf[9]]),
            length: u16::from_le_bytes([buf[10], buf[11]]),
            token: buf[12],
        };
        if buf.len() - HEADER_LEN != head.length as usize {
            return Err(PacketError::LengthMismatch {
                declared: head.length,
                actual: buf.len() - HEADER_LEN,
            });
        }
        Ok(head)
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than the fixed header size.
    #[error("datagram too short for header: {0} bytes")]
    BufferTooShort(usize),
    /// `length` field does not match the actual padding.
    #[error("declared padding {declared} bytes, found {actual}")]
    LengthMismatch { declared: u16, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let head = DataHead {
            timestamp: 1_234_567_890_123,
            sequence: 41,
            length: 19,
            token: b'k',
        };
        let bytes = head.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 19);
        assert_eq!(DataHead::decode(&bytes).unwrap(), head);
    }

    #[test]
    fn layout_is_little_endian() {
        let head = DataHead {
            timestamp: 0x0102_0304_0506_0708,
            sequence: 0xAABB,
            length: 0,
            token: b'z',
        };
        let bytes = head.encode();
        assert_eq!(bytes[0], 0x08, "timestamp low byte first");
        assert_eq!(bytes[7], 0x01);
        assert_eq!(bytes[8], 0xBB, "sequence low byte first");
        assert_eq!(bytes[9], 0xAA);
        assert_eq!(bytes[12], b'z');
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(DataHead::decode(&[]), Err(PacketError::BufferTooShort(0)));
    }

    #[test]
    fn decode_truncated_padding_returns_error() {
        let head = DataHead { timestamp: 0, sequence: 0, length: 50, token: b'a' };
        let mut bytes = head.encode();
        bytes.truncate(HEADER_LEN + 10);
        assert_eq!(
            DataHead::decode(&bytes),
            Err(PacketError::LengthMismatch { declared: 50, actual: 10 })
        );
    }

    #[test]
    fn negative_timestamp_survives() {
        let head = DataHead { timestamp: -5, sequence: 0, length: 0, token: 0 };
        assert_eq!(DataHead::decode(&head.encode()).unwrap().timestamp, -5);
    }
}
