//! Request/response correlation over the asynchronous notification channel.
//!
//! The wire protocol is write-on-control, notify-on-data. The correlator
//! turns that into a blocking "send a command, wait for the one response
//! with the expected opcode" operation with a deadline.
//!
//! Matching is by operation code only; the sequence field rides the wire but
//! cannot disambiguate two concurrent requests expecting the same response
//! opcode. The correlator therefore enforces a single outstanding request
//! per link: a second send while one is pending fails with `Busy`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::LinkError;
use crate::protocol::Frame;
use crate::transport::{Channel, LinkTransport, TransportError};

pub struct Correlator {
    // Held for the duration of one exchange; try-locked so a second sender
    // is rejected instead of queued behind an opaque mutex wait.
    in_flight: Mutex<()>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(()),
        }
    }

    /// Send `request` on the control channel and wait for the first
    /// well-formed data-channel notification carrying `expected_operation`.
    ///
    /// The data subscription is armed before the write so a fast response
    /// cannot be lost, and is torn down on every exit path. Undecodable
    /// notifications are ignored. Whichever of {matching frame, timeout,
    /// write failure, disconnect} happens first wins; later events are
    /// no-ops.
    pub fn send_and_await<T: LinkTransport + ?Sized>(
        &self,
        transport: &T,
        request: &Frame,
        expected_operation: u8,
        timeout: Duration,
    ) -> Result<Frame, LinkError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!(op = format!("0x{:02X}", request.operation), "rejected send while request in flight");
            return Err(LinkError::Busy);
        };

        let (tx, rx) = mpsc::sync_channel::<Frame>(1);
        // Armed -> Resolved guard. First swap wins; everything after is a no-op.
        let resolved = Arc::new(AtomicBool::new(false));
        let listener_resolved = resolved.clone();

        let subscription = transport.subscribe(
            Channel::Data,
            Box::new(move |bytes| {
                if listener_resolved.load(Ordering::Acquire) {
                    return;
                }
                let Some(frame) = Frame::decode(bytes) else {
                    trace!(len = bytes.len(), "ignoring undecodable notification");
                    return;
                };
                if frame.operation != expected_operation {
                    trace!(
                        op = format!("0x{:02X}", frame.operation),
                        "ignoring non-matching frame"
                    );
                    return;
                }
                if !listener_resolved.swap(true, Ordering::AcqRel) {
                    let _ = tx.try_send(frame);
                }
            }),
        )?;

        if let Err(e) = transport.write(Channel::Control, &request.encode(), true) {
            resolved.store(true, Ordering::Release);
            subscription.cancel();
            return Err(e.into());
        }
        debug!(
            op = format!("0x{:02X}", request.operation),
            seq = request.sequence,
            expect = format!("0x{:02X}", expected_operation),
            "request sent, awaiting response"
        );

        match rx.recv_timeout(timeout) {
            Ok(frame) => {
                subscription.cancel();
                Ok(frame)
            }
            Err(RecvTimeoutError::Timeout) => {
                resolved.store(true, Ordering::Release);
                subscription.cancel();
                warn!(
                    expect = format!("0x{:02X}", expected_operation),
                    ?timeout,
                    "response deadline expired"
                );
                Err(LinkError::Timeout {
                    expected: expected_operation,
                    timeout,
                })
            }
            // The transport dropped our listener (disconnect) before anything
            // matched; fail the pending request instead of hanging.
            Err(RecvTimeoutError::Disconnected) => {
                subscription.cancel();
                Err(LinkError::Transport(TransportError::Disconnected))
            }
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OP_HANDSHAKE_ACK, OP_HANDSHAKE_REQ, OP_SESSION_META};
    use crate::transport::MockTransport;
    use crate::transport::mock::Scripted;
    use std::time::Instant;

    fn request() -> Frame {
        Frame::new(OP_HANDSHAKE_REQ, 1, vec![0x01])
    }

    #[test]
    fn test_matching_response_resolves() {
        let mock = MockTransport::new();
        mock.queue_response(OP_HANDSHAKE_REQ, OP_HANDSHAKE_ACK, &[1, 2, 3]);

        let correlator = Correlator::new();
        let resp = correlator
            .send_and_await(&mock, &request(), OP_HANDSHAKE_ACK, Duration::from_secs(1))
            .unwrap();
        assert_eq!(resp.operation, OP_HANDSHAKE_ACK);
        assert_eq!(resp.payload, vec![1, 2, 3]);
        // Listener torn down after resolution.
        assert_eq!(mock.subscriber_count(), 0);
    }

    #[test]
    fn test_noise_before_match_is_ignored() {
        let mock = MockTransport::new();
        mock.queue_script(
            OP_HANDSHAKE_REQ,
            vec![
                Scripted::Raw(vec![0xFF, 0x00, 0x13]), // undecodable
                Scripted::Reply {
                    operation: OP_SESSION_META, // wrong opcode
                    payload: vec![9],
                },
                Scripted::Reply {
                    operation: OP_HANDSHAKE_ACK,
                    payload: vec![0x42],
                },
            ],
        );

        let correlator = Correlator::new();
        let resp = correlator
            .send_and_await(&mock, &request(), OP_HANDSHAKE_ACK, Duration::from_secs(1))
            .unwrap();
        assert_eq!(resp.payload, vec![0x42]);
    }

    #[test]
    fn test_timeout_and_listener_teardown() {
        let mock = MockTransport::new();
        mock.queue_silence(OP_HANDSHAKE_REQ);

        let correlator = Correlator::new();
        let deadline = Duration::from_millis(50);
        let start = Instant::now();
        let err = correlator
            .send_and_await(&mock, &request(), OP_HANDSHAKE_ACK, deadline)
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
        assert!(start.elapsed() >= deadline);
        // No stale listener left behind to match a later response.
        assert_eq!(mock.subscriber_count(), 0);
    }

    #[test]
    fn test_late_response_after_timeout_is_noop() {
        let mock = MockTransport::new();
        mock.queue_silence(OP_HANDSHAKE_REQ);

        let correlator = Correlator::new();
        let err = correlator
            .send_and_await(&mock, &request(), OP_HANDSHAKE_ACK, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));

        // A response arriving after timeout reaches nobody.
        let late = Frame::new(OP_HANDSHAKE_ACK, 1, vec![0x99]);
        mock.notify(&late.encode());
        assert_eq!(mock.subscriber_count(), 0);
    }

    #[test]
    fn test_dead_link_fails_immediately() {
        let mock = MockTransport::new();
        mock.disconnect();
        let correlator = Correlator::new();
        let err = correlator
            .send_and_await(&mock, &request(), OP_HANDSHAKE_ACK, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
    }

    #[test]
    fn test_second_send_while_pending_is_rejected() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_silence(OP_HANDSHAKE_REQ);
        let correlator = Arc::new(Correlator::new());

        let bg_mock = mock.clone();
        let bg_correlator = correlator.clone();
        let handle = std::thread::spawn(move || {
            bg_correlator.send_and_await(
                &*bg_mock,
                &request(),
                OP_HANDSHAKE_ACK,
                Duration::from_millis(500),
            )
        });

        // Give the first request time to arm.
        std::thread::sleep(Duration::from_millis(100));
        let err = correlator
            .send_and_await(&*mock, &request(), OP_HANDSHAKE_ACK, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, LinkError::Busy));

        // First request still times out on its own terms, unpolluted.
        let first = handle.join().unwrap();
        assert!(matches!(first, Err(LinkError::Timeout { .. })));
    }

    #[test]
    fn test_disconnect_while_pending_fails_with_transport_error() {
        let mock = Arc::new(MockTransport::new());
        mock.queue_silence(OP_HANDSHAKE_REQ);
        let correlator = Correlator::new();

        let killer = mock.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            killer.disconnect();
        });

        let err = correlator
            .send_and_await(&*mock, &request(), OP_HANDSHAKE_ACK, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Transport(TransportError::Disconnected)
        ));
        handle.join().unwrap();
    }
}
