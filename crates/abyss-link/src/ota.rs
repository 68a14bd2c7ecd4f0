//! OTA firmware update session.
//!
//! State machine: `Idle -> Begun -> Transferring -> Completed`, with
//! `Aborted` on any unrecoverable failure. Flow control is
//! offset-acknowledged: the device echoes the offset of every data chunk it
//! accepted, and the host only advances on a matching echo.
//!
//! Two retry layers, deliberately distinct:
//! - the transport retry wrapper re-attempts a whole request (timeout or
//!   write failure) up to `max_retries` times with a fixed backoff;
//! - the mismatch resend re-sends one chunk exactly once when the device
//!   acknowledges the wrong offset (content correction, not transport).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::correlator::Correlator;
use crate::error::LinkError;
use crate::events::{LinkEvent, LinkObserver, NullObserver, OtaPhase, OtaProgress};
use crate::protocol::{
    DEFAULT_MAX_RETRIES, DEFAULT_OTA_TIMEOUT, DEFAULT_RETRY_BACKOFF, Frame, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE, OP_OTA_ACK, OP_OTA_BEGIN, OP_OTA_DATA, OP_OTA_DONE, OP_OTA_END, OP_OTA_READY,
};
use crate::transport::LinkTransport;

/// Tunables for one OTA session.
#[derive(Debug, Clone)]
pub struct OtaOptions {
    /// Data chunk size; clamped to the MTU-safe range [20, 240].
    pub chunk_size: usize,
    /// Attempts per request before the session fails.
    pub max_retries: u32,
    /// Per-request response deadline.
    pub op_timeout: Duration,
    /// Fixed wait between retry attempts.
    pub retry_backoff: Duration,
}

impl Default for OtaOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::protocol::DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            op_timeout: DEFAULT_OTA_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl From<&LinkConfig> for OtaOptions {
    fn from(config: &LinkConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_retries: config.max_retries,
            op_timeout: config.ota_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }
}

/// OTA session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    Begun,
    Transferring,
    Completed,
    Aborted,
}

impl OtaState {
    fn phase(self) -> OtaPhase {
        match self {
            OtaState::Idle => OtaPhase::Idle,
            OtaState::Begun => OtaPhase::Begun,
            OtaState::Transferring => OtaPhase::Transferring,
            OtaState::Completed => OtaPhase::Completed,
            OtaState::Aborted => OtaPhase::Aborted,
        }
    }

    fn name(self) -> &'static str {
        match self {
            OtaState::Idle => "Idle",
            OtaState::Begun => "Begun",
            OtaState::Transferring => "Transferring",
            OtaState::Completed => "Completed",
            OtaState::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for OtaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One firmware update session over a connected link.
pub struct OtaSession<T: LinkTransport> {
    transport: T,
    correlator: Correlator,
    seq: AtomicU16,
    options: OtaOptions,
    state: OtaState,
    observer: Arc<dyn LinkObserver>,
}

impl<T: LinkTransport> OtaSession<T> {
    pub fn new(transport: T) -> Self {
        Self::with_options(transport, OtaOptions::default())
    }

    pub fn with_options(transport: T, options: OtaOptions) -> Self {
        Self {
            transport,
            correlator: Correlator::new(),
            seq: AtomicU16::new(1),
            options,
            state: OtaState::Idle,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Announce the update: total image size plus the target version string.
    pub fn begin(&mut self, total_size: u32, version: &str) -> Result<(), LinkError> {
        self.require_state(&[OtaState::Idle])?;
        let version_bytes = version.as_bytes();
        if version_bytes.len() > u8::MAX as usize {
            return Err(LinkError::violation("version string exceeds 255 bytes"));
        }
        let mut payload = Vec::with_capacity(5 + version_bytes.len());
        payload.extend_from_slice(&total_size.to_be_bytes());
        payload.push(version_bytes.len() as u8);
        payload.extend_from_slice(version_bytes);

        info!(size = total_size, version = version, "OTA begin");
        match self.send_with_retry(OP_OTA_BEGIN, OP_OTA_READY, &payload) {
            Ok(_) => {
                self.set_state(OtaState::Begun);
                Ok(())
            }
            Err(e) => {
                self.set_state(OtaState::Aborted);
                Err(e)
            }
        }
    }

    /// Stream the firmware image in offset-acknowledged chunks.
    ///
    /// `on_progress(bytes_sent, total_bytes)` fires after every accepted
    /// chunk and never after an abort.
    pub fn transfer(
        &mut self,
        firmware: &[u8],
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<(), LinkError> {
        self.require_state(&[OtaState::Begun])?;
        let chunk_size = self.options.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        let total = firmware.len() as u64;
        let mut offset = 0usize;

        while offset < firmware.len() {
            if self.state != OtaState::Transferring {
                self.set_state(OtaState::Transferring);
            }
            let size = chunk_size.min(firmware.len() - offset);
            let chunk = &firmware[offset..offset + size];

            match self.send_chunk(offset as u32, chunk) {
                Ok(()) => {}
                Err(e) => {
                    self.set_state(OtaState::Aborted);
                    return Err(e);
                }
            }

            offset += size;
            let progress = OtaProgress {
                bytes_sent: offset as u64,
                total_bytes: total,
            };
            self.observer.on_event(&LinkEvent::Progress(progress));
            on_progress(progress.bytes_sent, progress.total_bytes);
        }
        Ok(())
    }

    /// Finish the update.
    pub fn end(&mut self) -> Result<(), LinkError> {
        self.require_state(&[OtaState::Begun, OtaState::Transferring])?;
        match self.send_with_retry(OP_OTA_END, OP_OTA_DONE, &[]) {
            Ok(_) => {
                self.set_state(OtaState::Completed);
                info!("OTA complete");
                Ok(())
            }
            Err(e) => {
                self.set_state(OtaState::Aborted);
                Err(e)
            }
        }
    }

    /// Send one data chunk and reconcile the acknowledged offset. A single
    /// mismatch earns one resend; a second mismatch is fatal.
    fn send_chunk(&self, offset: u32, chunk: &[u8]) -> Result<(), LinkError> {
        let payload = encode_data(offset, chunk);
        let acked = self.data_exchange(&payload)?;
        if acked == offset {
            return Ok(());
        }
        warn!(sent = offset, acked = acked, "ack offset mismatch, resending chunk");
        let acked = self.data_exchange(&payload)?;
        if acked == offset {
            return Ok(());
        }
        Err(LinkError::AckMismatch {
            expected: offset,
            received: acked,
        })
    }

    fn data_exchange(&self, payload: &[u8]) -> Result<u32, LinkError> {
        let response = self.send_with_retry(OP_OTA_DATA, OP_OTA_ACK, payload)?;
        decode_ack_offset(&response.payload)
    }

    fn send_with_retry(&self, op: u8, expect: u8, payload: &[u8]) -> Result<Frame, LinkError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = Frame::new(op, self.next_seq(), payload.to_vec());
            match self
                .correlator
                .send_and_await(&self.transport, &request, expect, self.options.op_timeout)
            {
                Ok(response) => return Ok(response),
                Err(e) if attempt >= self.options.max_retries => {
                    return Err(LinkError::OtaFailed {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        op = format!("0x{op:02X}"),
                        attempt = attempt,
                        error = %e,
                        "request failed, backing off"
                    );
                    self.observer.on_event(&LinkEvent::Retrying {
                        attempt,
                        max: self.options.max_retries,
                    });
                    thread::sleep(self.options.retry_backoff);
                }
            }
        }
    }

    fn require_state(&self, allowed: &[OtaState]) -> Result<(), LinkError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LinkError::BadState {
                state: self.state.name(),
            })
        }
    }

    fn set_state(&mut self, next: OtaState) {
        debug!(from = %self.state, to = %next, "OTA state transition");
        self.observer.on_event(&LinkEvent::PhaseChanged {
            from: self.state.phase(),
            to: next.phase(),
        });
        self.state = next;
    }

    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

fn encode_data(offset: u32, chunk: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + chunk.len());
    payload.extend_from_slice(&offset.to_be_bytes());
    payload.extend_from_slice(chunk);
    payload
}

fn decode_ack_offset(payload: &[u8]) -> Result<u32, LinkError> {
    if payload.len() < 4 {
        return Err(LinkError::violation(format!(
            "ota ack payload too short: {} bytes",
            payload.len()
        )));
    }
    Ok(BigEndian::read_u32(&payload[..4]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use crate::transport::mock::Scripted;

    fn fast_options() -> OtaOptions {
        OtaOptions {
            chunk_size: 200,
            max_retries: 3,
            op_timeout: Duration::from_millis(40),
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn ack_payload(offset: u32) -> Vec<u8> {
        offset.to_be_bytes().to_vec()
    }

    #[test]
    fn test_begin_encodes_size_and_version() {
        let mock = MockTransport::new();
        mock.queue_response(OP_OTA_BEGIN, OP_OTA_READY, &[]);

        let mut ota = OtaSession::with_options(mock, fast_options());
        ota.begin(500, "1.2.3").unwrap();
        assert_eq!(ota.state(), OtaState::Begun);

        let frames = ota.transport().control_frames();
        assert_eq!(frames.len(), 1);
        let mut expected = vec![0, 0, 0x01, 0xF4, 5];
        expected.extend_from_slice(b"1.2.3");
        assert_eq!(frames[0].payload, expected);
    }

    #[test]
    fn test_transfer_500_bytes_in_200_byte_chunks() {
        let mock = MockTransport::new();
        mock.queue_response(OP_OTA_BEGIN, OP_OTA_READY, &[]);
        for offset in [0u32, 200, 400] {
            mock.queue_response(OP_OTA_DATA, OP_OTA_ACK, &ack_payload(offset));
        }
        mock.queue_response(OP_OTA_END, OP_OTA_DONE, &[]);

        let firmware: Vec<u8> = (0..500).map(|i| i as u8).collect();
        let mut ota = OtaSession::with_options(mock, fast_options());
        ota.begin(firmware.len() as u32, "2.0.0").unwrap();

        let mut progress = Vec::new();
        ota.transfer(&firmware, |sent, total| progress.push((sent, total)))
            .unwrap();
        ota.end().unwrap();
        assert_eq!(ota.state(), OtaState::Completed);
        assert_eq!(progress, vec![(200, 500), (400, 500), (500, 500)]);

        // Exactly 3 data frames at offsets 0, 200, 400 with sizes 200/200/100.
        let data_frames: Vec<Frame> = ota
            .transport()
            .control_frames()
            .into_iter()
            .filter(|f| f.operation == OP_OTA_DATA)
            .collect();
        assert_eq!(data_frames.len(), 3);
        for (frame, (offset, size)) in data_frames.iter().zip([(0u32, 200), (200, 200), (400, 100)])
        {
            assert_eq!(BigEndian::read_u32(&frame.payload[..4]), offset);
            assert_eq!(frame.payload.len() - 4, size);
            assert_eq!(
                &frame.payload[4..],
                &firmware[offset as usize..offset as usize + size]
            );
        }
    }

    #[test]
    fn test_wrong_ack_once_recovers_on_resend() {
        let mock = MockTransport::new();
        mock.queue_response(OP_OTA_BEGIN, OP_OTA_READY, &[]);
        mock.queue_response(OP_OTA_DATA, OP_OTA_ACK, &ack_payload(999)); // wrong
        mock.queue_response(OP_OTA_DATA, OP_OTA_ACK, &ack_payload(0)); // resend ok
        mock.queue_response(OP_OTA_END, OP_OTA_DONE, &[]);

        let mut ota = OtaSession::with_options(mock, fast_options());
        ota.begin(50, "1.0").unwrap();
        let mut calls = 0;
        ota.transfer(&[0xAB; 50], |_, _| calls += 1).unwrap();
        ota.end().unwrap();
        assert_eq!(calls, 1);
        assert_eq!(ota.state(), OtaState::Completed);
    }

    #[test]
    fn test_wrong_ack_twice_aborts_with_mismatch() {
        let mock = MockTransport::new();
        mock.queue_response(OP_OTA_BEGIN, OP_OTA_READY, &[]);
        mock.queue_response(OP_OTA_DATA, OP_OTA_ACK, &ack_payload(999));
        mock.queue_response(OP_OTA_DATA, OP_OTA_ACK, &ack_payload(777));

        let mut ota = OtaSession::with_options(mock, fast_options());
        ota.begin(50, "1.0").unwrap();
        let mut calls = 0;
        let err = ota.transfer(&[0xAB; 50], |_, _| calls += 1).unwrap_err();
        match err {
            LinkError::AckMismatch { expected, received } => {
                assert_eq!(expected, 0);
                assert_eq!(received, 777);
            }
            other => panic!("expected AckMismatch, got {other}"),
        }
        // No progress callback after the abort.
        assert_eq!(calls, 0);
        assert_eq!(ota.state(), OtaState::Aborted);
        // Session is parked; further operations are refused.
        assert!(matches!(ota.end(), Err(LinkError::BadState { .. })));
    }

    #[test]
    fn test_begin_rejects_oversized_version_string() {
        let mock = MockTransport::new();
        let mut ota = OtaSession::with_options(mock, fast_options());
        let long_version = "9".repeat(300);
        let err = ota.begin(100, &long_version).unwrap_err();
        assert!(matches!(err, LinkError::ProtocolViolation { .. }));
        // Rejected before anything hits the wire; a retry with a sane
        // version string is still possible.
        assert!(ota.transport().writes().is_empty());
        assert_eq!(ota.state(), OtaState::Idle);
    }

    #[test]
    fn test_short_ack_payload_is_violation() {
        let mock = MockTransport::new();
        mock.queue_response(OP_OTA_BEGIN, OP_OTA_READY, &[]);
        // Device acks with 2 bytes where a 4-byte offset is required.
        mock.queue_response(OP_OTA_DATA, OP_OTA_ACK, &[0x00, 0x01]);

        let mut ota = OtaSession::with_options(mock, fast_options());
        ota.begin(50, "1.0").unwrap();
        let mut calls = 0;
        let err = ota.transfer(&[0xAB; 50], |_, _| calls += 1).unwrap_err();
        assert!(matches!(err, LinkError::ProtocolViolation { .. }));
        assert_eq!(calls, 0);
        assert_eq!(ota.state(), OtaState::Aborted);
    }

    #[test]
    fn test_retry_exhaustion_fails_begin() {
        // No scripted responses: every attempt times out.
        let mock = MockTransport::new();
        let mut ota = OtaSession::with_options(mock, fast_options());
        let err = ota.begin(100, "1.0").unwrap_err();
        match err {
            LinkError::OtaFailed { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, LinkError::Timeout { .. }));
            }
            other => panic!("expected OtaFailed, got {other}"),
        }
        assert_eq!(ota.state(), OtaState::Aborted);
    }

    #[test]
    fn test_retry_recovers_after_one_silence() {
        let mock = MockTransport::new();
        mock.queue_script(OP_OTA_BEGIN, vec![Scripted::Silence]);
        mock.queue_response(OP_OTA_BEGIN, OP_OTA_READY, &[]);

        let mut ota = OtaSession::with_options(mock, fast_options());
        ota.begin(100, "1.0").unwrap();
        assert_eq!(ota.state(), OtaState::Begun);
        // Two begin frames on the wire, distinct sequence numbers.
        let frames = ota.transport().control_frames();
        assert_eq!(frames.len(), 2);
        assert_ne!(frames[0].sequence, frames[1].sequence);
    }

    #[test]
    fn test_chunk_size_clamped_to_mtu_bounds() {
        let mock = MockTransport::new();
        mock.queue_response(OP_OTA_BEGIN, OP_OTA_READY, &[]);
        for offset in [0u32, 240, 480] {
            mock.queue_response(OP_OTA_DATA, OP_OTA_ACK, &ack_payload(offset));
        }

        let options = OtaOptions {
            chunk_size: 4096, // clamps to 240
            ..fast_options()
        };
        let mut ota = OtaSession::with_options(mock, options);
        ota.begin(500, "1.0").unwrap();
        ota.transfer(&[0u8; 500], |_, _| {}).unwrap();

        let sizes: Vec<usize> = ota
            .transport()
            .control_frames()
            .into_iter()
            .filter(|f| f.operation == OP_OTA_DATA)
            .map(|f| f.payload.len() - 4)
            .collect();
        assert_eq!(sizes, vec![240, 240, 20]);
    }

    #[test]
    fn test_operations_rejected_in_wrong_state() {
        let mock = MockTransport::new();
        let mut ota = OtaSession::with_options(mock, fast_options());
        assert!(matches!(ota.end(), Err(LinkError::BadState { .. })));
        assert!(matches!(
            ota.transfer(&[1, 2, 3], |_, _| {}),
            Err(LinkError::BadState { .. })
        ));
    }
}
