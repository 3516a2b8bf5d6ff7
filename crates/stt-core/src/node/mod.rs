//! Node runtime: the single per-process coordinator.
//!
//! The [`Node`] owns one datagram transport, optionally one message
//! transport, the crypto adapter, the session and handshake registries,
//! and the inbound event queue. Inbound frames route by type:
//!
//! ```text
//! transport -> handle_incoming -> frame decode
//!     handshake types -> handshake registry -> session promotion
//!     DATA/control    -> session registry -> stream registry
//!     0x20-0x22, 0x80-0xFF -> user handler / event queue
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
#[allow(clippy::module_inception)]
pub mod node;
pub mod session;

pub use config::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_PACKET_SIZE, NodeConfig};
pub use error::{NodeError, Result};
pub use node::{
    DisconnectReason, Node, NodeEvent, NodeStats, StreamCloseReason, UserFrameHandler,
};
pub use session::{SessionHandle, SessionRegistry, StreamHandle};
