//! Handshake message payloads.
//!
//! The four handshake frames carry typed-value maps. Fields holding
//! ciphertext embed the sealing metadata alongside it; everything else is
//! plaintext, protected by the commitment/challenge/proof structure rather
//! than by frame-level encryption.

use crate::codec::{CodecError, Value};
use crate::error::HandshakeError;
use crate::session::SessionId;
use std::time::{SystemTime, UNIX_EPOCH};

/// Tolerated clock skew between peers, in milliseconds
pub const MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

/// Confirm status: handshake accepted
pub const STATUS_OK: i64 = 0;

/// Current time as milliseconds since the UNIX epoch
#[must_use]
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Reject a message timestamp outside the skew tolerance.
///
/// # Errors
///
/// Returns `HandshakeError::ClockSkew` with the observed skew.
pub fn check_timestamp(timestamp_ms: i64) -> Result<(), HandshakeError> {
    let skew_ms = (unix_millis() - timestamp_ms).abs();
    if skew_ms > MAX_CLOCK_SKEW_MS {
        return Err(HandshakeError::ClockSkew { skew_ms });
    }
    Ok(())
}

fn get_fixed<const N: usize>(
    map: &Value,
    field: &'static str,
) -> Result<[u8; N], CodecError> {
    let bytes = map
        .map_get(field)
        .ok_or(CodecError::MissingField(field))?
        .as_bytes()
        .ok_or(CodecError::InvalidField(field))?;
    bytes.try_into().map_err(|_| CodecError::InvalidField(field))
}

fn get_bytes(map: &Value, field: &'static str) -> Result<Vec<u8>, CodecError> {
    Ok(map
        .map_get(field)
        .ok_or(CodecError::MissingField(field))?
        .as_bytes()
        .ok_or(CodecError::InvalidField(field))?
        .to_vec())
}

fn get_int(map: &Value, field: &'static str) -> Result<i64, CodecError> {
    map.map_get(field)
        .ok_or(CodecError::MissingField(field))?
        .as_int()
        .ok_or(CodecError::InvalidField(field))
}

/// HELLO: the initiator commits to its identity and nonce before the nonce
/// is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    /// Initiator's node id
    pub node_id: [u8; 32],
    /// Initiator's fresh 32-byte nonce
    pub nonce: [u8; 32],
    /// Milliseconds since epoch
    pub timestamp_ms: i64,
    /// `hash(node_id || nonce)`
    pub commitment: [u8; 32],
}

impl HelloMessage {
    /// Encode to a payload map
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Value::Map(vec![
            (Value::str("commitment"), Value::bytes(&self.commitment)),
            (Value::str("node_id"), Value::bytes(&self.node_id)),
            (Value::str("nonce"), Value::bytes(&self.nonce)),
            (Value::str("timestamp"), Value::Int(self.timestamp_ms)),
        ])
        .encode()
    }

    /// Decode from a payload map
    ///
    /// # Errors
    ///
    /// Returns a codec error for a malformed or incomplete map.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let map = Value::decode(payload)?;
        Ok(Self {
            node_id: get_fixed(&map, "node_id")?,
            nonce: get_fixed(&map, "nonce")?,
            timestamp_ms: get_int(&map, "timestamp")?,
            commitment: get_fixed(&map, "commitment")?,
        })
    }
}

/// CHALLENGE: the responder reveals its identity and returns both nonces
/// sealed under the shared seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    /// Responder's node id
    pub node_id: [u8; 32],
    /// Responder's fresh 32-byte nonce
    pub nonce: [u8; 32],
    /// Sealed `nonce_i || nonce_r`
    pub ciphertext: Vec<u8>,
    /// Sealing metadata
    pub metadata: Vec<u8>,
    /// Milliseconds since epoch
    pub timestamp_ms: i64,
}

impl ChallengeMessage {
    /// Encode to a payload map
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Value::Map(vec![
            (Value::str("challenge"), Value::bytes(&self.ciphertext)),
            (Value::str("metadata"), Value::bytes(&self.metadata)),
            (Value::str("node_id"), Value::bytes(&self.node_id)),
            (Value::str("nonce"), Value::bytes(&self.nonce)),
            (Value::str("timestamp"), Value::Int(self.timestamp_ms)),
        ])
        .encode()
    }

    /// Decode from a payload map
    ///
    /// # Errors
    ///
    /// Returns a codec error for a malformed or incomplete map.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let map = Value::decode(payload)?;
        Ok(Self {
            node_id: get_fixed(&map, "node_id")?,
            nonce: get_fixed(&map, "nonce")?,
            ciphertext: get_bytes(&map, "challenge")?,
            metadata: get_bytes(&map, "metadata")?,
            timestamp_ms: get_int(&map, "timestamp")?,
        })
    }
}

/// AUTH_PROOF: the initiator proves it decrypted the challenge by sealing
/// the derived session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofMessage {
    /// Session id the initiator derived
    pub session_id: SessionId,
    /// Sealed session id bytes
    pub ciphertext: Vec<u8>,
    /// Sealing metadata
    pub metadata: Vec<u8>,
    /// Milliseconds since epoch
    pub timestamp_ms: i64,
}

impl ProofMessage {
    /// Encode to a payload map
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Value::Map(vec![
            (Value::str("metadata"), Value::bytes(&self.metadata)),
            (Value::str("proof"), Value::bytes(&self.ciphertext)),
            (
                Value::str("session_id"),
                Value::bytes(self.session_id.as_bytes()),
            ),
            (Value::str("timestamp"), Value::Int(self.timestamp_ms)),
        ])
        .encode()
    }

    /// Decode from a payload map
    ///
    /// # Errors
    ///
    /// Returns a codec error for a malformed or incomplete map.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let map = Value::decode(payload)?;
        Ok(Self {
            session_id: SessionId::from_bytes(get_fixed(&map, "session_id")?),
            ciphertext: get_bytes(&map, "proof")?,
            metadata: get_bytes(&map, "metadata")?,
            timestamp_ms: get_int(&map, "timestamp")?,
        })
    }
}

/// FINAL: the responder confirms the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmMessage {
    /// Session id the responder derived
    pub session_id: SessionId,
    /// 0 accepts the handshake
    pub status: i64,
    /// Milliseconds since epoch
    pub timestamp_ms: i64,
}

impl ConfirmMessage {
    /// Encode to a payload map
    ///
    /// # Errors
    ///
    /// Propagates codec errors.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Value::Map(vec![
            (
                Value::str("session_id"),
                Value::bytes(self.session_id.as_bytes()),
            ),
            (Value::str("status"), Value::Int(self.status)),
            (Value::str("timestamp"), Value::Int(self.timestamp_ms)),
        ])
        .encode()
    }

    /// Decode from a payload map
    ///
    /// # Errors
    ///
    /// Returns a codec error for a malformed or incomplete map.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let map = Value::decode(payload)?;
        Ok(Self {
            session_id: SessionId::from_bytes(get_fixed(&map, "session_id")?),
            status: get_int(&map, "status")?,
            timestamp_ms: get_int(&map, "timestamp")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let msg = HelloMessage {
            node_id: [1; 32],
            nonce: [2; 32],
            timestamp_ms: 1_700_000_000_000,
            commitment: [3; 32],
        };
        let decoded = HelloMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_challenge_roundtrip() {
        let msg = ChallengeMessage {
            node_id: [1; 32],
            nonce: [2; 32],
            ciphertext: vec![9; 80],
            metadata: vec![8; 24],
            timestamp_ms: 42,
        };
        let decoded = ChallengeMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_proof_roundtrip() {
        let msg = ProofMessage {
            session_id: SessionId::from_bytes([4; 8]),
            ciphertext: vec![9; 24],
            metadata: vec![8; 24],
            timestamp_ms: 42,
        };
        let decoded = ProofMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_confirm_roundtrip() {
        let msg = ConfirmMessage {
            session_id: SessionId::from_bytes([4; 8]),
            status: STATUS_OK,
            timestamp_ms: 42,
        };
        let decoded = ConfirmMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_hello_missing_field() {
        let partial = Value::Map(vec![(Value::str("node_id"), Value::bytes(&[1; 32]))])
            .encode()
            .unwrap();
        assert!(matches!(
            HelloMessage::decode(&partial),
            Err(CodecError::MissingField("nonce") | CodecError::MissingField("commitment"))
        ));
    }

    #[test]
    fn test_hello_wrong_field_width() {
        let bad = Value::Map(vec![
            (Value::str("commitment"), Value::bytes(&[3; 32])),
            (Value::str("node_id"), Value::bytes(&[1; 16])),
            (Value::str("nonce"), Value::bytes(&[2; 32])),
            (Value::str("timestamp"), Value::Int(1)),
        ])
        .encode()
        .unwrap();
        assert!(matches!(
            HelloMessage::decode(&bad),
            Err(CodecError::InvalidField("node_id"))
        ));
    }

    #[test]
    fn test_timestamp_tolerance() {
        assert!(check_timestamp(unix_millis()).is_ok());
        assert!(check_timestamp(unix_millis() - 60_000).is_ok());
        assert!(matches!(
            check_timestamp(unix_millis() - MAX_CLOCK_SKEW_MS - 1_000),
            Err(HandshakeError::ClockSkew { .. })
        ));
        assert!(matches!(
            check_timestamp(unix_millis() + MAX_CLOCK_SKEW_MS + 1_000),
            Err(HandshakeError::ClockSkew { .. })
        ));
    }
}
