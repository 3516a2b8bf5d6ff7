//! Error type for the Node API.

use crate::codec::CodecError;
use crate::error::{ConfigError, FrameError, HandshakeError, SessionError, StreamError};
use stt_crypto::CryptoError;
use stt_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by Node operations
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid configuration at construction
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake failure, surfaced to the initiator's `connect`
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Cryptographic failure; fatal to the session it occurred on
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Frame codec failure on the send path
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Payload codec failure on the send path
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Session lookup or state failure
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Stream state failure
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// A deadline expired
    #[error("operation timed out: {0}")]
    Timeout(&'static str),

    /// Operation requires a started node
    #[error("node not running")]
    NotRunning,

    /// `start` called on a running node
    #[error("node already running")]
    AlreadyRunning,

    /// Message transport requested but not configured
    #[error("message transport not configured")]
    MessageTransportDisabled,

    /// Frame type outside the user-defined 0x80-0xFF range
    #[error("frame type 0x{0:02X} is not in the user-defined range")]
    NotUserFrameType(u8),
}

impl From<crate::error::Error> for NodeError {
    fn from(err: crate::error::Error) -> Self {
        match err {
            crate::error::Error::Frame(e) => Self::Frame(e),
            crate::error::Error::Session(e) => Self::Session(e),
            crate::error::Error::Stream(e) => Self::Stream(e),
            crate::error::Error::Handshake(e) => Self::Handshake(e),
            crate::error::Error::Crypto(e) => Self::Crypto(e),
            crate::error::Error::Config(e) => Self::Config(e),
        }
    }
}

/// Result type for Node operations
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NodeError::NotRunning;
        assert_eq!(err.to_string(), "node not running");

        let err = NodeError::Timeout("handshake");
        assert!(err.to_string().contains("handshake"));

        let err = NodeError::NotUserFrameType(0x10);
        assert!(err.to_string().contains("0x10"));
    }

    #[test]
    fn test_core_error_conversion() {
        let core = crate::error::Error::Stream(StreamError::Closed);
        assert!(matches!(
            NodeError::from(core),
            NodeError::Stream(StreamError::Closed)
        ));
    }
}
