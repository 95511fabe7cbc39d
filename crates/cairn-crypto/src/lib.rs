//! Per-epoch key derivation and sealing.
//!
//! MLS hands every member the same secret for each epoch. From that secret we
//! derive an X25519 keypair, so any member of the epoch can open what another
//! member sealed for it, and nobody outside the epoch can.
//!
//! Sealing follows the HPKE base mode shape: an ephemeral X25519 key agrees a
//! shared secret with the epoch public key, HKDF-SHA256 stretches it into a
//! ChaCha20-Poly1305 key and nonce, and the output is the ephemeral public key
//! followed by the AEAD ciphertext.
//!
//! # Security
//!
//! The derived secret key is zeroized on drop. Keypairs are checked for
//! consistency before opening so a corrupted secret half fails loudly instead
//! of silently agreeing on a different key.

pub mod epoch;
pub mod error;

pub use epoch::{
    DerivedKeys, KEY_SIZE, SEAL_OVERHEAD, derive_keys, open, seal, seal_to, seal_with_rng,
};
pub use error::CryptoError;
