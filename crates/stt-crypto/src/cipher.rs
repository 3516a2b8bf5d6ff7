//! Session and stream scoped AEAD sealing.
//!
//! A [`SessionCipher`] wraps a derived session key and seals payloads with
//! `XChaCha20-Poly1305`. Every seal draws a fresh 24-byte nonce from the OS
//! CSPRNG and returns it as the opaque metadata blob; the 192-bit nonce
//! space makes random collisions negligible.
//!
//! A [`StreamCryptoContext`] carries a per-stream subkey derived from the
//! session key and the `(session_id, stream_id)` pair, so concurrent streams
//! of one session never share a `(key, nonce)` space.

use crate::error::CryptoError;
use crate::random::fill_random;
use crate::{SESSION_KEY_SIZE, SessionKey};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the metadata blob produced by sealing (the XChaCha nonce)
pub const METADATA_NONCE_SIZE: usize = 24;

/// AEAD cipher bound to one session key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionCipher {
    key: [u8; SESSION_KEY_SIZE],
}

impl SessionCipher {
    /// Create a cipher over a session key
    #[must_use]
    pub fn new(key: &SessionKey) -> Self {
        Self { key: *key.as_bytes() }
    }

    pub(crate) fn from_raw(key: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Seal a payload under this cipher's key.
    ///
    /// Returns `(ciphertext, metadata)`; the metadata is the fresh nonce and
    /// must be presented unmodified to [`Self::open`].
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RandomFailed` if the CSPRNG fails or
    /// `CryptoError::EncryptionFailed` on an AEAD failure.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let mut nonce = [0u8; METADATA_NONCE_SIZE];
        fill_random(&mut nonce)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok((ciphertext, nonce.to_vec()))
    }

    /// Open a sealed payload.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MalformedMetadata` if the metadata blob is not a
    /// nonce, or `CryptoError::DecryptionFailed` if authentication fails —
    /// including any tampering with the associated data.
    pub fn open(
        &self,
        ciphertext: &[u8],
        metadata: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if metadata.len() != METADATA_NONCE_SIZE {
            return Err(CryptoError::MalformedMetadata {
                expected: METADATA_NONCE_SIZE,
                actual: metadata.len(),
            });
        }

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(XNonce::from_slice(metadata), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Derive the crypto context for one stream of one session.
    ///
    /// The subkey is keyed BLAKE3 of the session and stream identifiers under
    /// the session key; both peers derive the same context.
    #[must_use]
    pub fn stream_context(&self, session_id: &[u8; 8], stream_id: u64) -> StreamCryptoContext {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(b"stt v0 stream context");
        hasher.update(session_id);
        hasher.update(&stream_id.to_le_bytes());
        let subkey = *hasher.finalize().as_bytes();

        StreamCryptoContext {
            cipher: SessionCipher::from_raw(subkey),
        }
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher(..)")
    }
}

/// Stream-scoped sealing context with a derived subkey.
#[derive(Debug, Clone)]
pub struct StreamCryptoContext {
    cipher: SessionCipher,
}

impl StreamCryptoContext {
    /// Seal a segment payload under the stream subkey
    ///
    /// # Errors
    ///
    /// See [`SessionCipher::seal`].
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        self.cipher.seal(plaintext, aad)
    }

    /// Open a segment payload sealed by the peer's matching context
    ///
    /// # Errors
    ///
    /// See [`SessionCipher::open`].
    pub fn open(
        &self,
        ciphertext: &[u8],
        metadata: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher.open(ciphertext, metadata, aad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SessionCipher {
        SessionCipher::new(&SessionKey::from_bytes([0x11; 32]))
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let c = cipher();
        let (ct, md) = c.seal(b"segment bytes", b"header").unwrap();
        assert_ne!(ct.as_slice(), b"segment bytes");
        assert_eq!(md.len(), METADATA_NONCE_SIZE);

        let pt = c.open(&ct, &md, b"header").unwrap();
        assert_eq!(pt, b"segment bytes");
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let c = cipher();
        let (mut ct, md) = c.seal(b"payload", b"aad").unwrap();
        ct[0] ^= 0xFF;
        assert!(matches!(
            c.open(&ct, &md, b"aad"),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_open_rejects_tampered_aad() {
        let c = cipher();
        let (ct, md) = c.seal(b"payload", b"aad").unwrap();
        assert!(matches!(
            c.open(&ct, &md, b"tampered"),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_open_rejects_short_metadata() {
        let c = cipher();
        let (ct, _) = c.seal(b"payload", b"aad").unwrap();
        assert!(matches!(
            c.open(&ct, &[0u8; 8], b"aad"),
            Err(CryptoError::MalformedMetadata { .. })
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let c = cipher();
        let other = SessionCipher::new(&SessionKey::from_bytes([0x22; 32]));
        let (ct, md) = c.seal(b"payload", b"aad").unwrap();
        assert!(other.open(&ct, &md, b"aad").is_err());
    }

    #[test]
    fn test_stream_contexts_are_isolated() {
        let c = cipher();
        let session_id = [1u8; 8];
        let a = c.stream_context(&session_id, 1);
        let b = c.stream_context(&session_id, 2);

        let (ct, md) = a.seal(b"for stream 1", b"aad").unwrap();
        assert!(b.open(&ct, &md, b"aad").is_err());
        assert_eq!(a.open(&ct, &md, b"aad").unwrap(), b"for stream 1");
    }

    #[test]
    fn test_peer_stream_contexts_interoperate() {
        let local = cipher();
        let remote = SessionCipher::new(&SessionKey::from_bytes([0x11; 32]));
        let session_id = [9u8; 8];

        let (ct, md) = local
            .stream_context(&session_id, 7)
            .seal(b"hello", b"aad")
            .unwrap();
        let pt = remote
            .stream_context(&session_id, 7)
            .open(&ct, &md, b"aad")
            .unwrap();
        assert_eq!(pt, b"hello");
    }
}
