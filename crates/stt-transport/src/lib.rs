//! # STT Transport
//!
//! Transport adapters for the STT protocol.
//!
//! Two transport shapes carry opaque frame buffers between peers:
//! - [`UdpTransport`]: datagram transport. Packets may be lost, reordered,
//!   or duplicated; the stream layer above is the sole source of
//!   reliability and ordering.
//! - [`MessageTransport`]: WebSocket binary messages. Reliable and ordered
//!   at the message level; framing applies unchanged.
//!
//! Both deliver `(buffer, peer_address)` pairs and expose the same
//! [`Transport`] contract to the node.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod transport;
pub mod udp;
pub mod websocket;

pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp::UdpTransport;
pub use websocket::MessageTransport;

/// Default maximum datagram payload, leaving room for IP + UDP headers
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1472;
