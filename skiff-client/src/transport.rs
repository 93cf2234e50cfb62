//! WebSocket transport layer
//!
//! Owns one physical duplex connection per [`Transport`], with automatic
//! reconnection and a bounded outgoing queue that drains only while the
//! socket is open.

mod backoff;
mod socket;

pub use backoff::Backoff;
#[cfg(test)]
pub(crate) use socket::Outgoing;
pub use socket::{
    Frame, FrameSender, Transport, TransportConfig, TransportEvent, TransportState,
    DEFAULT_BASE_DELAY, DEFAULT_MAX_BACKOFF,
};
