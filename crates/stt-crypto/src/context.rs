//! Per-node crypto context rooted in a seed.
//!
//! [`TransmissionCrypto`] is the adapter the protocol core holds. It is
//! constructed from the pre-shared seed, so handshake-scope sealing and
//! session-key derivation are both bound to seed possession: a peer holding
//! a different seed cannot decrypt the handshake challenge and derives a
//! different session key.

use crate::cipher::SessionCipher;
use crate::error::CryptoError;
use crate::{HASH_SIZE, MIN_SEED_LEN, NODE_ID_SIZE, SessionKey};
use std::collections::BTreeMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SEED_CONTEXT: &str = "stt v0 seed base key";
const NODE_ID_CONTEXT: &str = "stt v0 node identity";
const ROTATION_CONTEXT: &[u8] = b"stt v0 key rotation";

/// Per-node cryptographic context.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TransmissionCrypto {
    base_key: [u8; 32],
}

impl TransmissionCrypto {
    /// Construct a context from a seed.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SeedTooShort` if the seed is shorter than 32
    /// bytes.
    pub fn new(seed: &[u8]) -> Result<Self, CryptoError> {
        if seed.len() < MIN_SEED_LEN {
            return Err(CryptoError::SeedTooShort {
                expected: MIN_SEED_LEN,
                actual: seed.len(),
            });
        }

        Ok(Self {
            base_key: blake3::derive_key(SEED_CONTEXT, seed),
        })
    }

    /// Derive a 32-byte node identifier from identity input (the node seed).
    ///
    /// Deterministic and stable for the node's lifetime.
    #[must_use]
    pub fn derive_node_id(&self, identity_input: &[u8]) -> [u8; NODE_ID_SIZE] {
        blake3::derive_key(NODE_ID_CONTEXT, identity_input)
    }

    /// Derive the session key from handshake material.
    ///
    /// The material map is hashed entry by entry in key order with length
    /// prefixes, keyed by the seed-derived base key: both peers holding the
    /// same seed and the same material derive the same key.
    #[must_use]
    pub fn derive_session_key(&self, material: &BTreeMap<String, Vec<u8>>) -> SessionKey {
        let mut hasher = blake3::Hasher::new_keyed(&self.base_key);
        for (key, value) in material {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value);
        }
        SessionKey::from_bytes(*hasher.finalize().as_bytes())
    }

    /// Derive the next session key from the current one and a rotation nonce.
    ///
    /// Deterministic; both peers running the same rotation step derive the
    /// same key. The output is always distinct from the input.
    #[must_use]
    pub fn rotate_session_key(&self, current: &SessionKey, rotation_nonce: &[u8]) -> SessionKey {
        let mut hasher = blake3::Hasher::new_keyed(current.as_bytes());
        hasher.update(ROTATION_CONTEXT);
        hasher.update(rotation_nonce);
        SessionKey::from_bytes(*hasher.finalize().as_bytes())
    }

    /// Hash arbitrary bytes to 32 bytes
    #[must_use]
    pub fn hash(&self, data: &[u8]) -> [u8; HASH_SIZE] {
        *blake3::hash(data).as_bytes()
    }

    /// Seal handshake-scope plaintext under the seed-derived base key.
    ///
    /// Returns `(ciphertext, metadata)`.
    ///
    /// # Errors
    ///
    /// See [`SessionCipher::seal`].
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        SessionCipher::from_raw(self.base_key).seal(plaintext, aad)
    }

    /// Open handshake-scope ciphertext sealed by a peer holding the same seed.
    ///
    /// # Errors
    ///
    /// See [`SessionCipher::open`].
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        metadata: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        SessionCipher::from_raw(self.base_key).open(ciphertext, metadata, aad)
    }
}

impl std::fmt::Debug for TransmissionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransmissionCrypto(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> BTreeMap<String, Vec<u8>> {
        let mut m = BTreeMap::new();
        m.insert("nonce_i".to_string(), vec![1u8; 32]);
        m.insert("nonce_r".to_string(), vec![2u8; 32]);
        m.insert("node_id_i".to_string(), vec![3u8; 32]);
        m.insert("node_id_r".to_string(), vec![4u8; 32]);
        m.insert("capabilities".to_string(), vec![0]);
        m
    }

    #[test]
    fn test_seed_too_short() {
        assert!(matches!(
            TransmissionCrypto::new(&[0u8; 31]),
            Err(CryptoError::SeedTooShort {
                expected: 32,
                actual: 31
            })
        ));
        assert!(TransmissionCrypto::new(&[0u8; 32]).is_ok());
        assert!(TransmissionCrypto::new(&[0u8; 64]).is_ok());
    }

    #[test]
    fn test_node_id_deterministic() {
        let crypto = TransmissionCrypto::new(&[0x42; 32]).unwrap();
        let a = crypto.derive_node_id(&[0xAA; 32]);
        let b = crypto.derive_node_id(&[0xAA; 32]);
        assert_eq!(a, b);
        assert_ne!(a, crypto.derive_node_id(&[0xBB; 32]));
    }

    #[test]
    fn test_session_key_same_material_same_key() {
        let alice = TransmissionCrypto::new(&[0x42; 32]).unwrap();
        let bob = TransmissionCrypto::new(&[0x42; 32]).unwrap();
        assert_eq!(
            alice.derive_session_key(&material()),
            bob.derive_session_key(&material())
        );
    }

    #[test]
    fn test_session_key_depends_on_seed() {
        let alice = TransmissionCrypto::new(&[0x42; 32]).unwrap();
        let mallory = TransmissionCrypto::new(&[0x43; 32]).unwrap();
        assert_ne!(
            alice.derive_session_key(&material()),
            mallory.derive_session_key(&material())
        );
    }

    #[test]
    fn test_session_key_depends_on_material() {
        let crypto = TransmissionCrypto::new(&[0x42; 32]).unwrap();
        let mut other = material();
        other.insert("nonce_i".to_string(), vec![9u8; 32]);
        assert_ne!(
            crypto.derive_session_key(&material()),
            crypto.derive_session_key(&other)
        );
    }

    #[test]
    fn test_rotation_deterministic_and_distinct() {
        let crypto = TransmissionCrypto::new(&[0x42; 32]).unwrap();
        let key = crypto.derive_session_key(&material());

        let rotated = crypto.rotate_session_key(&key, &1u64.to_le_bytes());
        assert_ne!(rotated, key);
        assert_eq!(
            rotated,
            crypto.rotate_session_key(&key, &1u64.to_le_bytes())
        );
        assert_ne!(
            rotated,
            crypto.rotate_session_key(&key, &2u64.to_le_bytes())
        );
    }

    #[test]
    fn test_handshake_scope_encrypt_roundtrip() {
        let alice = TransmissionCrypto::new(&[0x42; 32]).unwrap();
        let bob = TransmissionCrypto::new(&[0x42; 32]).unwrap();

        let (ct, md) = alice.encrypt(b"challenge nonces", b"tag").unwrap();
        assert_eq!(bob.decrypt(&ct, &md, b"tag").unwrap(), b"challenge nonces");
    }

    #[test]
    fn test_handshake_scope_wrong_seed_fails() {
        let alice = TransmissionCrypto::new(&[0x42; 32]).unwrap();
        let mallory = TransmissionCrypto::new(&[0x43; 32]).unwrap();

        let (ct, md) = alice.encrypt(b"challenge nonces", b"tag").unwrap();
        assert!(mallory.decrypt(&ct, &md, b"tag").is_err());
    }

    #[test]
    fn test_hash_deterministic() {
        let crypto = TransmissionCrypto::new(&[0x42; 32]).unwrap();
        assert_eq!(crypto.hash(b"data"), crypto.hash(b"data"));
        assert_ne!(crypto.hash(b"data"), crypto.hash(b"datb"));
    }
}
