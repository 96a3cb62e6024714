//! MQTT Protocol definitions and types
//!
//! The v3.1.1 packet subset a forwarding client needs: connect, publish
//! with QoS 0/1 acknowledgement, subscribe, keepalive and disconnect.

mod error;
mod packet;
mod return_code;

pub use error::{DecodeError, EncodeError};
pub use packet::*;
pub use return_code::{ConnectReturnCode, SubAckReturnCode};

/// Protocol level sent in CONNECT (MQTT v3.1.1)
pub const PROTOCOL_LEVEL: u8 = 4;

/// Delivery guarantee; ordered so `min` picks the weaker one
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        [Self::AtMostOnce, Self::AtLeastOnce, Self::ExactlyOnce]
            .get(usize::from(v))
            .copied()
    }
}

impl std::fmt::Display for QoS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}
