//! Protocol constants for the Abyss One link protocol.

use std::time::Duration;

// ============================================================================
// Operation Codes
// ============================================================================

/// Handshake request (Host -> Device)
pub const OP_HANDSHAKE_REQ: u8 = 0x01;
/// Handshake acknowledge, carries identity TLV (Device -> Host)
pub const OP_HANDSHAKE_ACK: u8 = 0x81;

/// Session metadata request
pub const OP_GET_SESSION: u8 = 0x02;
/// Session metadata response
pub const OP_SESSION_META: u8 = 0x82;

/// Indexed chunk request
pub const OP_GET_NEXT_CHUNK: u8 = 0x03;
/// Chunk data response
pub const OP_CHUNK_DATA: u8 = 0x83;

/// Chunk receipt acknowledgement (Host -> Device, fire-and-forget)
pub const OP_ACK: u8 = 0x04;
/// Negative acknowledgement. Reserved in the opcode space; no flow consumes it.
pub const OP_NACK: u8 = 0x05;

/// OTA begin request, carries total size + version string
pub const OP_OTA_BEGIN: u8 = 0x06;
/// OTA ready response
pub const OP_OTA_READY: u8 = 0x86;

/// OTA data chunk, carries offset + bytes
pub const OP_OTA_DATA: u8 = 0x07;
/// OTA data acknowledge, echoes the offset
pub const OP_OTA_ACK: u8 = 0x87;

/// OTA end request (empty payload)
pub const OP_OTA_END: u8 = 0x08;
/// OTA done response
pub const OP_OTA_DONE: u8 = 0x88;

// ============================================================================
// Frame Layout
// ============================================================================

/// Header: op (1) + sequence (2, BE) + payload length (2, BE).
pub const FRAME_HEADER_LEN: usize = 5;
/// CRC-16 trailer length.
pub const FRAME_CRC_LEN: usize = 2;
/// Smallest well-formed frame (empty payload).
pub const MIN_FRAME_LEN: usize = FRAME_HEADER_LEN + FRAME_CRC_LEN;
/// Largest payload expressible by the 16-bit length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

// ============================================================================
// Transfer Sizing
// ============================================================================

/// Lower bound for OTA chunk size (fits any negotiated MTU).
pub const MIN_CHUNK_SIZE: usize = 20;
/// Upper bound for OTA chunk size (MTU safety margin).
pub const MAX_CHUNK_SIZE: usize = 240;
/// Default OTA chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 180;

// ============================================================================
// Timing & Retry Defaults
// ============================================================================

/// Default timeout for session operations (handshake, metadata, chunk pull).
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout for OTA operations (larger images, slower flash writes).
pub const DEFAULT_OTA_TIMEOUT: Duration = Duration::from_secs(15);
/// Default transport-retry budget for OTA begin/transfer/end.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Fixed backoff between OTA retry attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(150);
