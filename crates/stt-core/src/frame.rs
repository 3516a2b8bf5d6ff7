//! Frame encoding and decoding for the STT wire protocol.
//!
//! Every transmission unit is one frame: a fixed prefix (magic, type,
//! flags, session id) followed by varint-coded stream id, sequence, and
//! length-prefixed metadata and payload. All multi-byte integers are
//! little-endian.
//!
//! The header fields `{frame_type, flags, session_id, stream_id, sequence}`
//! are bound as AEAD associated data when a payload is encrypted, so any
//! header tamper invalidates decryption.

use crate::codec::{decode_varint, encode_varint, varint_len};
use crate::error::{Error, FrameError};
use crate::session::SessionId;
use stt_crypto::StreamCryptoContext;

/// Frame magic: `ST`
pub const MAGIC: [u8; 2] = [0x53, 0x54];

/// Fixed portion of the header: magic, type, flags, session id
pub const FIXED_HEADER_SIZE: usize = 2 + 1 + 1 + 8;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Handshake message 1: initiator's identity commitment
    Hello,
    /// Handshake message 2: responder's encrypted challenge
    Challenge,
    /// Handshake message 3: initiator's authentication proof
    Proof,
    /// Handshake message 4: responder's confirmation
    Confirm,
    /// Encrypted stream segment
    Data,
    /// Explicit stream creation
    StreamOpen,
    /// Stream termination
    StreamClose,
    /// Delivery acknowledgment / flow-control credit grant
    Ack,
    /// Session liveness probe
    Keepalive,
    /// Session termination
    Disconnect,
    /// Endpoint-routing range (0x20-0x22), passed through to the user layer
    Endpoint(u8),
    /// User-defined range (0x80-0xFF), never interpreted by the core
    User(u8),
    /// Any other nonzero type byte; dispatch decides what to do with it
    Unknown(u8),
}

impl FrameType {
    /// Parse a frame type byte.
    ///
    /// Only 0x00 is invalid at the codec level; unrecognized values decode
    /// as [`FrameType::Unknown`] and are dropped by the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::InvalidFrameType` for 0x00.
    pub fn from_byte(value: u8) -> Result<Self, FrameError> {
        match value {
            0x00 => Err(FrameError::InvalidFrameType(0)),
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Challenge),
            0x03 => Ok(Self::Proof),
            0x04 => Ok(Self::Confirm),
            0x10 => Ok(Self::Data),
            0x11 => Ok(Self::StreamOpen),
            0x12 => Ok(Self::StreamClose),
            0x13 => Ok(Self::Ack),
            0x14 => Ok(Self::Keepalive),
            0x15 => Ok(Self::Disconnect),
            0x20..=0x22 => Ok(Self::Endpoint(value)),
            0x80..=0xFF => Ok(Self::User(value)),
            other => Ok(Self::Unknown(other)),
        }
    }

    /// Wire byte for this type
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Hello => 0x01,
            Self::Challenge => 0x02,
            Self::Proof => 0x03,
            Self::Confirm => 0x04,
            Self::Data => 0x10,
            Self::StreamOpen => 0x11,
            Self::StreamClose => 0x12,
            Self::Ack => 0x13,
            Self::Keepalive => 0x14,
            Self::Disconnect => 0x15,
            Self::Endpoint(b) | Self::User(b) | Self::Unknown(b) => b,
        }
    }

    /// Whether this is one of the four handshake types
    #[must_use]
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::Hello | Self::Challenge | Self::Proof | Self::Confirm
        )
    }
}

/// Frame flags bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is encrypted
    pub const ENCRYPTED: u8 = 0b0000_0001;
    /// Final segment of a bounded stream
    pub const FIN: u8 = 0b0000_0010;

    const KNOWN: u8 = Self::ENCRYPTED | Self::FIN;

    /// Create empty flags
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Parse a flags byte, rejecting reserved bits.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::UnknownFlags` if any bit outside the known set
    /// is set.
    pub fn from_byte(value: u8) -> Result<Self, FrameError> {
        if value & !Self::KNOWN != 0 {
            return Err(FrameError::UnknownFlags(value));
        }
        Ok(Self(value))
    }

    /// Add the encrypted flag
    #[must_use]
    pub fn with_encrypted(mut self) -> Self {
        self.0 |= Self::ENCRYPTED;
        self
    }

    /// Add the final-segment flag
    #[must_use]
    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    /// Check the encrypted flag
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    /// Check the final-segment flag
    #[must_use]
    pub fn is_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    /// Raw byte value
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Flags bitmap
    pub flags: FrameFlags,
    /// Owning session; zero during handshake types
    pub session_id: SessionId,
    /// Stream id; 0 for session-scope frames
    pub stream_id: u64,
    /// Sender-assigned sequence, per stream for DATA
    pub sequence: u64,
    /// Opaque crypto metadata produced by sealing
    pub metadata: Vec<u8>,
    /// Application bytes; ciphertext when `flags` has the encrypted bit
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a session-scope frame with no payload
    #[must_use]
    pub fn new(frame_type: FrameType, session_id: SessionId) -> Self {
        Self {
            frame_type,
            flags: FrameFlags::new(),
            session_id,
            stream_id: 0,
            sequence: 0,
            metadata: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Encoded size of this frame in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_SIZE
            + varint_len(self.stream_id)
            + varint_len(self.sequence)
            + varint_len(self.metadata.len() as u64)
            + self.metadata.len()
            + varint_len(self.payload.len() as u64)
            + self.payload.len()
    }

    /// Encode to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::FrameTooLarge` if the encoding would exceed
    /// `max_frame_size`.
    pub fn encode(&self, max_frame_size: usize) -> Result<Vec<u8>, FrameError> {
        let size = self.encoded_len();
        if size > max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                limit: max_frame_size,
            });
        }

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&MAGIC);
        out.push(self.frame_type.as_byte());
        out.push(self.flags.as_u8());
        out.extend_from_slice(self.session_id.as_bytes());
        encode_varint(self.stream_id, &mut out);
        encode_varint(self.sequence, &mut out);
        encode_varint(self.metadata.len() as u64, &mut out);
        out.extend_from_slice(&self.metadata);
        encode_varint(self.payload.len() as u64, &mut out);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode wire bytes, strictly.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::FrameTooLarge` for oversized input and a
    /// malformed-frame variant for bad magic, reserved flags, varint
    /// overruns, truncated lengths, or trailing bytes.
    pub fn decode(data: &[u8], max_frame_size: usize) -> Result<Self, FrameError> {
        if data.len() > max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: data.len(),
                limit: max_frame_size,
            });
        }
        if data.len() < FIXED_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FIXED_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if data[0..2] != MAGIC {
            return Err(FrameError::BadMagic([data[0], data[1]]));
        }

        let frame_type = FrameType::from_byte(data[2])?;
        let flags = FrameFlags::from_byte(data[3])?;
        let mut session_id = [0u8; 8];
        session_id.copy_from_slice(&data[4..12]);

        let mut offset = FIXED_HEADER_SIZE;
        let (stream_id, used) = decode_varint(&data[offset..])?;
        offset += used;
        let (sequence, used) = decode_varint(&data[offset..])?;
        offset += used;

        let (metadata_len, used) = decode_varint(&data[offset..])?;
        offset += used;
        let metadata_len = usize::try_from(metadata_len).map_err(|_| FrameError::LengthOverrun)?;
        let end = offset
            .checked_add(metadata_len)
            .ok_or(FrameError::LengthOverrun)?;
        let metadata = data.get(offset..end).ok_or(FrameError::LengthOverrun)?.to_vec();
        offset = end;

        let (payload_len, used) = decode_varint(&data[offset..])?;
        offset += used;
        let payload_len = usize::try_from(payload_len).map_err(|_| FrameError::LengthOverrun)?;
        let end = offset
            .checked_add(payload_len)
            .ok_or(FrameError::LengthOverrun)?;
        let payload = data.get(offset..end).ok_or(FrameError::LengthOverrun)?.to_vec();
        offset = end;

        if offset != data.len() {
            return Err(FrameError::TrailingBytes(data.len() - offset));
        }

        Ok(Self {
            frame_type,
            flags,
            session_id: SessionId::from_bytes(session_id),
            stream_id,
            sequence,
            metadata,
            payload,
        })
    }

    /// Deterministic serialization of the header fields bound as AEAD
    /// associated data: `{frame_type, flags, session_id, stream_id,
    /// sequence}`.
    #[must_use]
    pub fn associated_data(&self) -> Vec<u8> {
        let mut ad = Vec::with_capacity(FIXED_HEADER_SIZE + 2 * 10);
        ad.push(self.frame_type.as_byte());
        ad.push(self.flags.as_u8());
        ad.extend_from_slice(self.session_id.as_bytes());
        encode_varint(self.stream_id, &mut ad);
        encode_varint(self.sequence, &mut ad);
        ad
    }

    /// Encrypt the payload in place.
    ///
    /// Sets the encrypted flag, binds the header fields and the rotation
    /// nonce as associated data, and replaces `payload`/`metadata` with the
    /// sealed output.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::AlreadyEncrypted` if called twice, or the
    /// underlying `CryptoError`.
    pub fn encrypt_payload(
        &mut self,
        ctx: &StreamCryptoContext,
        rotation_nonce: &[u8],
    ) -> Result<(), Error> {
        if self.flags.is_encrypted() {
            return Err(FrameError::AlreadyEncrypted.into());
        }

        self.flags = self.flags.with_encrypted();
        let mut ad = self.associated_data();
        ad.extend_from_slice(rotation_nonce);

        let (ciphertext, metadata) = ctx.seal(&self.payload, &ad)?;
        self.payload = ciphertext;
        self.metadata = metadata;
        Ok(())
    }

    /// Verify and decrypt the payload in place.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::NotEncrypted` if the encrypted flag is clear, or
    /// `CryptoError::DecryptionFailed` on any authentication failure —
    /// including a tampered header field.
    pub fn decrypt_payload(
        &mut self,
        ctx: &StreamCryptoContext,
        rotation_nonce: &[u8],
    ) -> Result<(), Error> {
        if !self.flags.is_encrypted() {
            return Err(FrameError::NotEncrypted.into());
        }

        let mut ad = self.associated_data();
        ad.extend_from_slice(rotation_nonce);

        let plaintext = ctx.open(&self.payload, &self.metadata, &ad)?;
        self.payload = plaintext;
        self.metadata.clear();
        self.flags = FrameFlags(self.flags.as_u8() & !FrameFlags::ENCRYPTED);
        Ok(())
    }
}
