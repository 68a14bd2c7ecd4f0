//! Session link - application-level operations on a connected dive computer.
//!
//! Built on the correlator: handshake/identification, session metadata
//! query, and the indexed chunk-pull used to sync measurement, alert and
//! compass history.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info};

use crate::config::LinkConfig;
use crate::correlator::Correlator;
use crate::error::LinkError;
use crate::events::{LinkEvent, LinkObserver, NullObserver};
use crate::protocol::{
    Frame, OP_ACK, OP_CHUNK_DATA, OP_GET_NEXT_CHUNK, OP_GET_SESSION, OP_HANDSHAKE_ACK,
    OP_HANDSHAKE_REQ, OP_SESSION_META,
};
use crate::transport::{Channel, LinkTransport};

/// Identity reported by the device during handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub model: String,
    pub serial: String,
    pub firmware_version: String,
}

/// Metadata for the most recent dive session on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionMeta {
    pub dive_id: u32,
    pub start_ts: u32,
    pub duration: u32,
    pub samples_count: u32,
    pub alerts_count: u32,
    pub compass_count: u32,
}

/// The record streams a pull can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkKind {
    Samples = 1,
    Alerts = 2,
    Compass = 3,
}

/// One indexed unit of a history pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: ChunkKind,
    pub index: u32,
    pub bytes: Vec<u8>,
}

// TLV tags in the handshake payload.
const TAG_MODEL: u8 = 0x01;
const TAG_SERIAL: u8 = 0x02;
const TAG_FIRMWARE: u8 = 0x03;

/// A connected link session. One per peripheral; operations are
/// serialized by the correlator's single-outstanding guard.
pub struct SessionLink<T: LinkTransport> {
    transport: T,
    correlator: Correlator,
    seq: AtomicU16,
    timeout: Duration,
    observer: Arc<dyn LinkObserver>,
}

impl<T: LinkTransport> SessionLink<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, &LinkConfig::default())
    }

    pub fn with_config(transport: T, config: &LinkConfig) -> Self {
        Self {
            transport,
            correlator: Correlator::new(),
            seq: AtomicU16::new(1),
            timeout: config.op_timeout(),
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn exchange(&self, op: u8, expect: u8, payload: Vec<u8>) -> Result<Frame, LinkError> {
        let request = Frame::new(op, self.next_seq(), payload);
        self.correlator
            .send_and_await(&self.transport, &request, expect, self.timeout)
    }

    /// Identify the connected device.
    pub fn handshake(&self) -> Result<DeviceIdentity, LinkError> {
        let response = self.exchange(OP_HANDSHAKE_REQ, OP_HANDSHAKE_ACK, vec![0x01])?;
        let identity = decode_identity_tlv(&response.payload)?;
        info!(
            model = %identity.model,
            serial = %identity.serial,
            firmware = %identity.firmware_version,
            "handshake complete"
        );
        Ok(identity)
    }

    /// Query metadata for the latest session recorded after `since_ts`.
    pub fn get_session(&self, since_ts: u32) -> Result<SessionMeta, LinkError> {
        let mut payload = vec![0u8; 4];
        BigEndian::write_u32(&mut payload, since_ts);
        let response = self.exchange(OP_GET_SESSION, OP_SESSION_META, payload)?;
        decode_session_meta(&response.payload)
    }

    /// Pull `total` chunks of `kind`, lazily, in strict index order.
    ///
    /// Any kind/index mismatch, transport failure or timeout aborts the
    /// pull; the iterator yields the error once and then fuses. A pull is
    /// restartable from scratch, never resumable mid-sequence.
    pub fn pull_chunks(&self, kind: ChunkKind, total: u32) -> ChunkPull<'_, T> {
        debug!(kind = kind as u8, total = total, "starting chunk pull");
        ChunkPull {
            link: self,
            kind,
            total,
            next_index: 0,
            failed: false,
        }
    }

    fn pull_one(&self, kind: ChunkKind, index: u32) -> Result<Chunk, LinkError> {
        let response = self.exchange(
            OP_GET_NEXT_CHUNK,
            OP_CHUNK_DATA,
            encode_chunk_ref(kind, index),
        )?;
        let chunk = decode_chunk(&response.payload)?;
        if chunk.0 != kind as u8 || chunk.1 != index {
            return Err(LinkError::violation(format!(
                "chunk mismatch: requested (kind {}, index {}), got (kind {}, index {})",
                kind as u8, index, chunk.0, chunk.1
            )));
        }
        // Receipt acknowledgement. A failed ack write aborts the pull: the
        // device would otherwise re-serve a chunk we already consumed.
        let ack = Frame::new(OP_ACK, self.next_seq(), encode_chunk_ref(kind, index));
        self.transport.write(Channel::Control, &ack.encode(), true)?;
        self.observer.on_event(&LinkEvent::ChunkPulled {
            kind: kind as u8,
            index,
            len: chunk.2.len(),
        });
        Ok(Chunk {
            kind,
            index,
            bytes: chunk.2,
        })
    }
}

/// Lazy chunk sequence; fuses after the first error.
pub struct ChunkPull<'a, T: LinkTransport> {
    link: &'a SessionLink<T>,
    kind: ChunkKind,
    total: u32,
    next_index: u32,
    failed: bool,
}

impl<T: LinkTransport> Iterator for ChunkPull<'_, T> {
    type Item = Result<Chunk, LinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next_index >= self.total {
            return None;
        }
        match self.link.pull_one(self.kind, self.next_index) {
            Ok(chunk) => {
                self.next_index += 1;
                Some(Ok(chunk))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn encode_chunk_ref(kind: ChunkKind, index: u32) -> Vec<u8> {
    let mut payload = vec![kind as u8, 0, 0, 0, 0];
    BigEndian::write_u32(&mut payload[1..5], index);
    payload
}

fn decode_chunk(payload: &[u8]) -> Result<(u8, u32, Vec<u8>), LinkError> {
    if payload.len() < 5 {
        return Err(LinkError::violation(format!(
            "chunk payload too short: {} bytes",
            payload.len()
        )));
    }
    let kind = payload[0];
    let index = BigEndian::read_u32(&payload[1..5]);
    Ok((kind, index, payload[5..].to_vec()))
}

/// Decode the handshake identity TLV. Tags: 0x01 model, 0x02 serial,
/// 0x03 firmware, values UTF-8. Unknown tags are length-prefixed and
/// skipped, so new device revisions stay compatible.
fn decode_identity_tlv(payload: &[u8]) -> Result<DeviceIdentity, LinkError> {
    let mut identity = DeviceIdentity::default();
    let mut i = 0;
    while i < payload.len() {
        if i + 2 > payload.len() {
            return Err(LinkError::violation("truncated TLV header in handshake"));
        }
        let tag = payload[i];
        let len = payload[i + 1] as usize;
        i += 2;
        if i + len > payload.len() {
            return Err(LinkError::violation(format!(
                "TLV value for tag 0x{tag:02X} overruns payload"
            )));
        }
        let value = String::from_utf8_lossy(&payload[i..i + len]).into_owned();
        i += len;
        match tag {
            TAG_MODEL => identity.model = value,
            TAG_SERIAL => identity.serial = value,
            TAG_FIRMWARE => identity.firmware_version = value,
            _ => debug!(tag = format!("0x{tag:02X}"), "skipping unknown TLV tag"),
        }
    }
    Ok(identity)
}

fn decode_session_meta(payload: &[u8]) -> Result<SessionMeta, LinkError> {
    if payload.len() < 24 {
        return Err(LinkError::violation(format!(
            "session metadata too short: {} bytes, expected 24",
            payload.len()
        )));
    }
    let field = |i: usize| BigEndian::read_u32(&payload[i * 4..i * 4 + 4]);
    Ok(SessionMeta {
        dive_id: field(0),
        start_ts: field(1),
        duration: field(2),
        samples_count: field(3),
        alerts_count: field(4),
        compass_count: field(5),
    })
}
