//! # STT Crypto
//!
//! Crypto adapter for the STT (Seigr Toolset Transmissions) protocol.
//!
//! This crate realizes the opaque cryptographic capability the core protocol
//! depends on:
//! - Seed-rooted per-node context with node-id derivation
//! - Deterministic session-key derivation from handshake material
//! - Deterministic session-key rotation
//! - `XChaCha20-Poly1305` AEAD sealing with opaque metadata
//! - Per-stream crypto contexts with derived subkeys
//! - Secure random generation for nonces
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | AEAD | XChaCha20-Poly1305 |
//! | Hash | BLAKE3 |
//! | KDF | keyed BLAKE3 / BLAKE3 derive_key |
//!
//! The core treats the metadata blob returned by sealing as opaque bytes; in
//! this realization it is the 24-byte AEAD nonce.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cipher;
pub mod context;
pub mod error;
pub mod random;

pub use cipher::{METADATA_NONCE_SIZE, SessionCipher, StreamCryptoContext};
pub use context::TransmissionCrypto;
pub use error::CryptoError;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Minimum accepted seed length in bytes
pub const MIN_SEED_LEN: usize = 32;

/// Node identifier size in bytes
pub const NODE_ID_SIZE: usize = 32;

/// Session key size in bytes
pub const SESSION_KEY_SIZE: usize = 32;

/// Hash output size in bytes
pub const HASH_SIZE: usize = 32;

/// Symmetric session key derived from handshake material.
///
/// Never transmitted; zeroized on drop. Rotation produces a fresh
/// `SessionKey` via [`TransmissionCrypto::rotate_session_key`].
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Construct from raw key bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_roundtrip() {
        let key = SessionKey::from_bytes([7u8; 32]);
        assert_eq!(key.as_bytes(), &[7u8; 32]);
    }

    #[test]
    fn test_session_key_debug_redacted() {
        let key = SessionKey::from_bytes([7u8; 32]);
        let rendered = format!("{key:?}");
        assert_eq!(rendered, "SessionKey(..)");
        assert!(!rendered.contains('7'));
    }
}
