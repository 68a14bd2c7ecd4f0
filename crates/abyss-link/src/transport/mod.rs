//! Transport layer module.

pub mod mock;
pub mod traits;

pub use mock::MockTransport;
pub use traits::{Channel, LinkTransport, NotifyFn, Subscription, TransportError};
