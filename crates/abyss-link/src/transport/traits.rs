//! Transport layer abstraction.
//!
//! Defines the `LinkTransport` trait over the physical wireless link.
//! Connection lifecycle (scanning, pairing, connect/disconnect) belongs to
//! the caller; the protocol core only writes bytes and listens for
//! notifications on two logical channels.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("peripheral disconnected")]
    Disconnected,

    #[error("write failed on {channel}: {message}")]
    WriteFailed { channel: Channel, message: String },

    #[error("subscribe failed on {channel}: {message}")]
    SubscribeFailed { channel: Channel, message: String },
}

/// Logical channel names. Mapping to physical characteristics is the
/// transport implementor's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Commands are written here.
    Control,
    /// Responses arrive here as asynchronous notifications.
    Data,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Control => write!(f, "control"),
            Channel::Data => write!(f, "data"),
        }
    }
}

/// Notification callback. Receives the raw bytes of one notification.
///
/// Must not call back into the transport: implementations may invoke it
/// while holding internal locks.
pub type NotifyFn = Box<dyn Fn(&[u8]) + Send + 'static>;

/// Handle for an active notification subscription.
///
/// Cancels on `cancel()` or on drop. A transport that tears down its
/// subscriber list (disconnect) renders the handle a no-op.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Explicitly unsubscribe.
    pub fn cancel(mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Abstract link transport interface.
///
/// This trait enables:
/// - Production implementations over a platform BLE stack
/// - Mock implementation for unit testing
pub trait LinkTransport: Send + Sync {
    /// Write raw bytes to a channel. `with_response` requests delivery
    /// acknowledgement from the link layer where supported.
    fn write(&self, channel: Channel, bytes: &[u8], with_response: bool)
    -> Result<(), TransportError>;

    /// Subscribe to asynchronous notifications on a channel.
    fn subscribe(&self, channel: Channel, on_bytes: NotifyFn)
    -> Result<Subscription, TransportError>;

    /// Check if the peripheral is still connected.
    fn is_connected(&self) -> bool;
}

// One physical link often backs both a session link and an OTA session.
impl<T: LinkTransport + ?Sized> LinkTransport for &T {
    fn write(
        &self,
        channel: Channel,
        bytes: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        (**self).write(channel, bytes, with_response)
    }

    fn subscribe(
        &self,
        channel: Channel,
        on_bytes: NotifyFn,
    ) -> Result<Subscription, TransportError> {
        (**self).subscribe(channel, on_bytes)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

impl<T: LinkTransport + ?Sized> LinkTransport for std::sync::Arc<T> {
    fn write(
        &self,
        channel: Channel,
        bytes: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        (**self).write(channel, bytes, with_response)
    }

    fn subscribe(
        &self,
        channel: Channel,
        on_bytes: NotifyFn,
    ) -> Result<Subscription, TransportError> {
        (**self).subscribe(channel, on_bytes)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
