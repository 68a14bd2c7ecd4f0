//! Operation-level error taxonomy.
//!
//! Malformed frames never appear here: the correlator drops them silently
//! and keeps waiting. Everything a caller can observe is one of the
//! variants below.

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum LinkError {
    /// No matching response arrived within the deadline.
    #[error("link timeout after {timeout:?} waiting for op 0x{expected:02X}")]
    Timeout { expected: u8, timeout: Duration },

    /// Write or subscribe failure at the transport adapter.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A request was issued while another was still in flight on this link.
    #[error("request already in flight on this link")]
    Busy,

    /// The peer answered with something the protocol does not allow here
    /// (chunk kind/index mismatch, short payload, broken TLV).
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// OTA offset acknowledgement disagreed twice in a row.
    #[error("ota ack mismatch: sent offset {expected}, device acknowledged {received}")]
    AckMismatch { expected: u32, received: u32 },

    /// Retry budget exhausted on an OTA step.
    #[error("update failed after {attempts} attempts: {source}")]
    OtaFailed {
        attempts: u32,
        #[source]
        source: Box<LinkError>,
    },

    /// Operation called from a state that does not allow it.
    #[error("invalid operation in state {state}")]
    BadState { state: &'static str },
}

impl LinkError {
    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        LinkError::ProtocolViolation {
            reason: reason.into(),
        }
    }
}
