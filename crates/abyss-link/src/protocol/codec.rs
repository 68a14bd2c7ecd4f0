//! Wire frame encoding and decoding.
//!
//! Layout (big-endian throughout):
//!
//! ```text
//! byte 0       : operation code
//! bytes 1-2    : sequence
//! bytes 3-4    : payload length N
//! bytes 5..5+N : payload
//! last 2 bytes : CRC-16 (poly 0x1021, init 0xFFFF) over bytes 0..5+N
//! ```
//!
//! Decoding is pure and total: anything malformed comes back as `None`.
//! The transport may deliver partial or corrupted notifications, so a
//! failed decode is expected noise, not an error.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use super::constants::{FRAME_HEADER_LEN, MIN_FRAME_LEN};

/// One complete wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub operation: u8,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(operation: u8, sequence: u16, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= u16::MAX as usize);
        Self {
            operation,
            sequence,
            payload,
        }
    }

    /// Encode into the wire layout. Always succeeds for payloads <= 65535 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_FRAME_LEN + self.payload.len());
        buf.push(self.operation);
        buf.write_u16::<BigEndian>(self.sequence).unwrap();
        buf.write_u16::<BigEndian>(self.payload.len() as u16).unwrap();
        buf.extend_from_slice(&self.payload);
        let crc = crc16(&buf);
        buf.write_u16::<BigEndian>(crc).unwrap();
        buf
    }

    /// Decode one frame. Returns `None` if the buffer is too short, the
    /// declared payload length overruns it, or the checksum disagrees.
    pub fn decode(bytes: &[u8]) -> Option<Frame> {
        if bytes.len() < MIN_FRAME_LEN {
            return None;
        }
        let operation = bytes[0];
        let sequence = BigEndian::read_u16(&bytes[1..3]);
        let len = BigEndian::read_u16(&bytes[3..5]) as usize;
        let body_end = FRAME_HEADER_LEN + len;
        if bytes.len() < body_end + 2 {
            return None;
        }
        let received = BigEndian::read_u16(&bytes[body_end..body_end + 2]);
        if crc16(&bytes[..body_end]) != received {
            return None;
        }
        Some(Frame {
            operation,
            sequence,
            payload: bytes[FRAME_HEADER_LEN..body_end].to_vec(),
        })
    }
}

/// CRC-16/XMODEM variant: poly 0x1021, init 0xFFFF, MSB-first, no final XOR.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
