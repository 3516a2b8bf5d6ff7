//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Seed shorter than the 32-byte minimum
    #[error("seed too short: expected at least {expected} bytes, got {actual}")]
    SeedTooShort {
        /// Required minimum length
        expected: usize,
        /// Actual length supplied
        actual: usize,
    },

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Crypto metadata blob is not a valid nonce
    #[error("malformed crypto metadata: expected {expected} bytes, got {actual}")]
    MalformedMetadata {
        /// Expected metadata length
        expected: usize,
        /// Actual metadata length
        actual: usize,
    },

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
