//! Protocol module - Abyss link wire protocol definitions.

pub mod codec;
pub mod constants;

pub use codec::{Frame, crc16};
pub use constants::*;
