//! Abyss-Link: device communication core for the Abyss One dive computer.
//!
//! Implements the binary link protocol spoken over a short-range wireless
//! connection: framing, request/response correlation, sequential history
//! chunk pull, and chunked OTA firmware update.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: opcodes, wire constants, frame codec (pure, no I/O)
//! - **Transport**: link abstraction (caller-provided backend, mock)
//! - **Correlator**: one request, one expected response, one deadline
//! - **Link**: handshake, session metadata, chunk pull
//! - **Ota**: firmware-update state machine with ack'd flow control
//! - **Firmware**: distribution metadata and version ordering
//! - **Events**: observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use abyss_link::link::{ChunkKind, SessionLink};
//! use abyss_link::transport::MockTransport;
//!
//! let transport = MockTransport::new();
//! let link = SessionLink::new(transport);
//! let identity = link.handshake().expect("handshake failed");
//! let meta = link.get_session(0).expect("session query failed");
//! for chunk in link.pull_chunks(ChunkKind::Samples, meta.samples_count) {
//!     let chunk = chunk.expect("pull aborted");
//!     println!("chunk {} ({} bytes)", chunk.index, chunk.bytes.len());
//! }
//! # let _ = identity;
//! ```

pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod firmware;
pub mod link;
pub mod ota;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use config::LinkConfig;
pub use correlator::Correlator;
pub use error::LinkError;
pub use events::{LinkEvent, LinkObserver, NullObserver, OtaPhase, OtaProgress, TracingObserver};
pub use firmware::{FirmwareEndpoint, FirmwareRelease, FwVersion, VersionError};
pub use link::{Chunk, ChunkKind, DeviceIdentity, SessionLink, SessionMeta};
pub use ota::{OtaOptions, OtaSession, OtaState};
pub use protocol::Frame;
pub use transport::{Channel, LinkTransport, MockTransport, Subscription, TransportError};
