//! # STT Core
//!
//! Core protocol implementation for STT (Seigr Toolset Transmissions):
//! encrypted byte streams between nodes that authenticate with a
//! pre-shared seed.
//!
//! This crate provides:
//! - **Node runtime**: the per-process coordinator and high-level API
//! - **Frame codec**: the `ST` wire frame with AEAD-bound headers
//! - **Varint / typed-value codec**: canonical header and payload encoding
//! - **Handshake**: the four-message seed-possession exchange
//! - **Sessions**: encrypted connection records with key rotation
//! - **Streams**: ordered, reliable, encrypted channels with flow control
//!
//! ## Quick Start
//!
//! ```no_run
//! use stt_core::{Node, NodeConfig, NodeEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new(vec![0xAA; 32], vec![0x42; 32]);
//!     let node = Node::new(config)?;
//!     node.start().await?;
//!
//!     let session = node.connect("127.0.0.1:7000".parse()?).await?;
//!     node.send_to_session(session, 1, b"hello").await?;
//!
//!     while let Some(event) = node.receive().await {
//!         if let NodeEvent::Data { payload, .. } = event {
//!             println!("received {} bytes", payload.len());
//!         }
//!     }
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                   Node (coordination)                  │
//! ├────────────────────────────────────────────────────────┤
//! │     Sessions (authenticated, encrypted connections)    │
//! ├────────────────────────────────────────────────────────┤
//! │    Streams (ordered, reliable, multiplexed channels)   │
//! ├────────────────────────────────────────────────────────┤
//! │          Frames (encrypted protocol data units)        │
//! ├────────────────────────────────────────────────────────┤
//! │        Transports (UDP datagrams / WebSocket)          │
//! └────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod node;
pub mod session;
pub mod storage;
pub mod stream;

pub use codec::{CodecError, Value, decode_varint, encode_varint, varint_len};
pub use error::{ConfigError, Error, FrameError, HandshakeError, SessionError, StreamError};
pub use frame::{FIXED_HEADER_SIZE, Frame, FrameFlags, FrameType, MAGIC};
pub use handshake::{
    HandshakeOutcome, HandshakeRegistry, InitiatorHandshake, ResponderHandshake,
};
pub use node::{
    DisconnectReason, Node, NodeConfig, NodeError, NodeEvent, NodeStats, StreamCloseReason,
    UserFrameHandler,
};
pub use session::{
    RotationPolicy, Session, SessionId, SessionState, SessionStats, TransportKind,
};
pub use storage::{MemoryStorage, StorageProvider};
pub use stream::{Stream, StreamMode, StreamState, StreamStats};

/// Protocol version (major.minor encoded as u32)
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Session identifier size in bytes
pub const SESSION_ID_SIZE: usize = 8;
