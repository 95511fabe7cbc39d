//! Error types for epoch encryption.

use thiserror::Error;

/// Errors raised by sealing and opening.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Authentication failed: ciphertext tampered or sealed for other keys
    #[error("decryption failed")]
    Decryption,

    /// Ciphertext too short to contain the ephemeral key and tag
    #[error("ciphertext too short: {len} bytes (need at least {min})")]
    CiphertextTooShort {
        /// Actual length
        len: usize,
        /// Minimum sealed length
        min: usize,
    },

    /// Keypair halves do not belong together, or the scalar is not canonical
    #[error("invalid key pair")]
    InvalidKey,

    /// Diffie-Hellman produced the all-zero output (low-order point)
    #[error("non-contributory key agreement")]
    NonContributory,

    /// AEAD refused to encrypt
    #[error("encryption failed")]
    Encryption,
}
