//! Error types for the STT core protocol.

use crate::codec::CodecError;
use crate::session::SessionId;
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Frame codec error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Session error
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Stream error
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Handshake error
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] stt_crypto::CryptoError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Frame-level errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Buffer too short for the fixed header
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Leading magic bytes are not `ST`
    #[error("bad magic: {0:02X?}")]
    BadMagic([u8; 2]),

    /// Invalid frame type byte (only 0x00 is invalid at the codec level)
    #[error("invalid frame type: 0x{0:02X}")]
    InvalidFrameType(u8),

    /// A reserved flag bit is set
    #[error("unknown flag bits set: 0b{0:08b}")]
    UnknownFlags(u8),

    /// Declared length exceeds the remaining buffer
    #[error("declared length exceeds remaining buffer")]
    LengthOverrun,

    /// Bytes remain after a complete frame
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    /// Frame exceeds the configured size limit
    #[error("frame too large: {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Size of the rejected frame
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// `encrypt_payload` called on an already-encrypted frame
    #[error("payload already encrypted")]
    AlreadyEncrypted,

    /// `decrypt_payload` called on a plaintext frame
    #[error("payload not encrypted")]
    NotEncrypted,

    /// Varint or typed-value error inside the header
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Invalid state for the requested operation
    #[error("invalid state for operation")]
    InvalidState,

    /// Operation on a closed or closing session
    #[error("session closed")]
    Closed,

    /// No session with the given id
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// No stream with the given id in this session
    #[error("unknown stream: {0}")]
    UnknownStream(u64),
}

/// Stream-level errors
#[derive(Debug, Error)]
pub enum StreamError {
    /// Send on a closed stream
    #[error("stream closed")]
    Closed,

    /// Send after a bounded stream's `end`
    #[error("stream ended")]
    Ended,

    /// `end` called on a live stream
    #[error("stream is not bounded")]
    NotBounded,

    /// Segment sequence too far ahead of the receive cursor
    #[error("reorder buffer overflow: sequence {sequence} exceeds window of {limit}")]
    ReorderBufferOverflow {
        /// Offending sequence number
        sequence: u64,
        /// Configured reorder window
        limit: u64,
    },

    /// The send sequence counter would wrap
    #[error("sequence counter exhausted")]
    SequenceExhausted,
}

/// Handshake-level errors.
///
/// Surfaced to the initiator's `connect`; responders drop silently.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// HELLO commitment does not match the revealed identity and nonce
    #[error("commitment mismatch")]
    CommitmentMismatch,

    /// Decrypted challenge does not contain the expected nonces
    #[error("challenge nonce mismatch")]
    ChallengeMismatch,

    /// Peer's session id does not match the locally derived one
    #[error("session id mismatch")]
    SessionIdMismatch,

    /// Message timestamp outside the clock-skew tolerance
    #[error("timestamp outside tolerance: {skew_ms} ms of skew")]
    ClockSkew {
        /// Observed skew in milliseconds
        skew_ms: i64,
    },

    /// Message arrived in a state that does not expect it
    #[error("unexpected {got} in state {state}")]
    UnexpectedMessage {
        /// Message kind received
        got: &'static str,
        /// State the machine was in
        state: &'static str,
    },

    /// Responder refused the handshake
    #[error("handshake rejected with status {0}")]
    Rejected(i64),

    /// The exchange deadline expired
    #[error("handshake timed out")]
    TimedOut,

    /// A handshake-scope decryption or random failure
    #[error(transparent)]
    Crypto(#[from] stt_crypto::CryptoError),

    /// A malformed handshake payload
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Configuration errors, raised at node construction
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A seed shorter than the 32-byte minimum
    #[error("{which} too short: {actual} bytes, minimum is 32")]
    SeedTooShort {
        /// Which seed failed validation
        which: &'static str,
        /// Supplied length
        actual: usize,
    },

    /// A limit that must be at least 1 was zero
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),

    /// Datagram packet size outside the usable range
    #[error("max_packet_size {size} outside {min}..={max}")]
    PacketSizeOutOfRange {
        /// Configured size
        size: usize,
        /// Minimum usable size
        min: usize,
        /// Maximum UDP payload
        max: usize,
    },

    /// Frame size limit smaller than a single packet
    #[error("max_frame_size {frame} smaller than max_packet_size {packet}")]
    FrameSmallerThanPacket {
        /// Configured frame limit
        frame: usize,
        /// Configured packet limit
        packet: usize,
    },
}
