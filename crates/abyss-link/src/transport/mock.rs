//! Mock transport for testing.
//!
//! Behaves like a scripted peripheral: each control-channel write is decoded
//! and answered with the next scripted step for that request opcode,
//! delivered to data-channel subscribers. Unscripted requests stay silent,
//! which is how timeout paths are exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::traits::{Channel, LinkTransport, NotifyFn, Subscription, TransportError};
use crate::protocol::Frame;

/// One scripted reaction to a request.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Respond with a well-formed frame (sequence echoes the request's).
    Reply { operation: u8, payload: Vec<u8> },
    /// Deliver raw bytes as-is (noise, malformed frames).
    Raw(Vec<u8>),
    /// Consume the request without replying.
    Silence,
}

struct Subscriber {
    id: u64,
    channel: Channel,
    callback: NotifyFn,
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    scripts: Mutex<HashMap<u8, VecDeque<Vec<Scripted>>>>,
    write_log: Mutex<Vec<(Channel, Vec<u8>)>>,
    connected: Mutex<bool>,
    fail_write_at: Mutex<Option<u64>>,
    write_count: AtomicU64,
    next_id: AtomicU64,
}

/// Mock transport for unit testing protocol logic.
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                scripts: Mutex::new(HashMap::new()),
                write_log: Mutex::new(Vec::new()),
                connected: Mutex::new(true),
                fail_write_at: Mutex::new(None),
                write_count: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queue a multi-step script for the next request carrying `request_op`.
    pub fn queue_script(&self, request_op: u8, steps: Vec<Scripted>) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(request_op)
            .or_default()
            .push_back(steps);
    }

    /// Queue a single well-formed response frame.
    pub fn queue_response(&self, request_op: u8, response_op: u8, payload: &[u8]) {
        self.queue_script(
            request_op,
            vec![Scripted::Reply {
                operation: response_op,
                payload: payload.to_vec(),
            }],
        );
    }

    /// Queue raw notification bytes for the next request.
    pub fn queue_raw(&self, request_op: u8, bytes: &[u8]) {
        self.queue_script(request_op, vec![Scripted::Raw(bytes.to_vec())]);
    }

    /// Queue a consumed-but-unanswered request.
    pub fn queue_silence(&self, request_op: u8) {
        self.queue_script(request_op, vec![Scripted::Silence]);
    }

    /// Push an unsolicited data-channel notification.
    pub fn notify(&self, bytes: &[u8]) {
        self.deliver(Channel::Data, bytes);
    }

    /// Make the nth write (1-based, counted across channels) fail.
    pub fn fail_write(&self, nth: u64) {
        *self.inner.fail_write_at.lock().unwrap() = Some(nth);
    }

    /// All captured writes, in order.
    pub fn writes(&self) -> Vec<(Channel, Vec<u8>)> {
        self.inner.write_log.lock().unwrap().clone()
    }

    /// Decoded frames written to the control channel, in order.
    pub fn control_frames(&self) -> Vec<Frame> {
        self.writes()
            .iter()
            .filter(|(ch, _)| *ch == Channel::Control)
            .filter_map(|(_, bytes)| Frame::decode(bytes))
            .collect()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Simulate peripheral disconnect. Live subscriptions are torn down so
    /// pending waits fail instead of hanging.
    pub fn disconnect(&self) {
        *self.inner.connected.lock().unwrap() = false;
        self.inner.subscribers.lock().unwrap().clear();
    }

    /// Simulate reconnect.
    pub fn reconnect(&self) {
        *self.inner.connected.lock().unwrap() = true;
    }

    fn deliver(&self, channel: Channel, bytes: &[u8]) {
        let subscribers = self.inner.subscribers.lock().unwrap();
        for sub in subscribers.iter().filter(|s| s.channel == channel) {
            (sub.callback)(bytes);
        }
    }

    fn respond_to(&self, request: &Frame) {
        let steps = self
            .inner
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.operation)
            .and_then(|q| q.pop_front());
        let Some(steps) = steps else {
            return;
        };
        for step in steps {
            match step {
                Scripted::Reply { operation, payload } => {
                    let frame = Frame::new(operation, request.sequence, payload);
                    self.deliver(Channel::Data, &frame.encode());
                }
                Scripted::Raw(bytes) => self.deliver(Channel::Data, &bytes),
                Scripted::Silence => {}
            }
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkTransport for MockTransport {
    fn write(
        &self,
        channel: Channel,
        bytes: &[u8],
        _with_response: bool,
    ) -> Result<(), TransportError> {
        if !*self.inner.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let nth = self.inner.write_count.fetch_add(1, Ordering::Relaxed) + 1;
        if *self.inner.fail_write_at.lock().unwrap() == Some(nth) {
            return Err(TransportError::WriteFailed {
                channel,
                message: "injected write failure".into(),
            });
        }
        self.inner
            .write_log
            .lock()
            .unwrap()
            .push((channel, bytes.to_vec()));
        if channel == Channel::Control
            && let Some(frame) = Frame::decode(bytes)
        {
            self.respond_to(&frame);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        channel: Channel,
        on_bytes: NotifyFn,
    ) -> Result<Subscription, TransportError> {
        if !*self.inner.connected.lock().unwrap() {
            return Err(TransportError::NotConnected);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().unwrap().push(Subscriber {
            id,
            channel,
            callback: on_bytes,
        });
        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(move || {
            inner.subscribers.lock().unwrap().retain(|s| s.id != id);
        }))
    }

    fn is_connected(&self) -> bool {
        *self.inner.connected.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OP_HANDSHAKE_ACK, OP_HANDSHAKE_REQ};
    use std::sync::mpsc;

    #[test]
    fn test_scripted_reply_reaches_subscriber() {
        let mock = MockTransport::new();
        mock.queue_response(OP_HANDSHAKE_REQ, OP_HANDSHAKE_ACK, &[0xAB]);

        let (tx, rx) = mpsc::channel();
        let _sub = mock
            .subscribe(Channel::Data, Box::new(move |b| tx.send(b.to_vec()).unwrap()))
            .unwrap();

        let req = Frame::new(OP_HANDSHAKE_REQ, 7, vec![0x01]);
        mock.write(Channel::Control, &req.encode(), true).unwrap();

        let delivered = Frame::decode(&rx.recv().unwrap()).unwrap();
        assert_eq!(delivered.operation, OP_HANDSHAKE_ACK);
        assert_eq!(delivered.sequence, 7);
        assert_eq!(delivered.payload, vec![0xAB]);
    }

    #[test]
    fn test_unscripted_request_is_silent() {
        let mock = MockTransport::new();
        let (tx, rx) = mpsc::channel();
        let _sub = mock
            .subscribe(Channel::Data, Box::new(move |b| tx.send(b.to_vec()).unwrap()))
            .unwrap();

        let req = Frame::new(OP_HANDSHAKE_REQ, 1, vec![0x01]);
        mock.write(Channel::Control, &req.encode(), true).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let mock = MockTransport::new();
        let sub = mock.subscribe(Channel::Data, Box::new(|_| {})).unwrap();
        assert_eq!(mock.subscriber_count(), 1);
        drop(sub);
        assert_eq!(mock.subscriber_count(), 0);
    }

    #[test]
    fn test_disconnect_fails_writes_and_clears_subscribers() {
        let mock = MockTransport::new();
        let _sub = mock.subscribe(Channel::Data, Box::new(|_| {})).unwrap();
        mock.disconnect();
        assert_eq!(mock.subscriber_count(), 0);
        assert!(mock.write(Channel::Control, &[0x00], true).is_err());
    }

    #[test]
    fn test_raw_script_delivers_bytes_verbatim() {
        let mock = MockTransport::new();
        // Not a decodable frame; subscribers see it byte-for-byte.
        mock.queue_raw(OP_HANDSHAKE_REQ, &[0xDE, 0xAD, 0xBE]);

        let (tx, rx) = mpsc::channel();
        let _sub = mock
            .subscribe(Channel::Data, Box::new(move |b| tx.send(b.to_vec()).unwrap()))
            .unwrap();

        let req = Frame::new(OP_HANDSHAKE_REQ, 3, vec![]);
        mock.write(Channel::Control, &req.encode(), true).unwrap();
        assert_eq!(rx.recv().unwrap(), vec![0xDE, 0xAD, 0xBE]);
    }

    #[test]
    fn test_reconnect_restores_link() {
        let mock = MockTransport::new();
        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(mock.write(Channel::Control, &[0x00], true).is_err());
        assert!(mock.subscribe(Channel::Data, Box::new(|_| {})).is_err());

        mock.reconnect();
        assert!(mock.is_connected());
        let _sub = mock.subscribe(Channel::Data, Box::new(|_| {})).unwrap();
        mock.write(Channel::Control, &[0x00], true).unwrap();
        assert_eq!(mock.writes().len(), 1);
    }
}
