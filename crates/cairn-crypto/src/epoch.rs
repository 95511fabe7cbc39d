//! Epoch key derivation, sealing and opening.
//!
//! # Wire layout
//!
//! ```text
//! ┌──────────────────────┬─────────────────────────────┐
//! │ ephemeral pk (32 B)  │ ChaCha20-Poly1305 ct + tag  │
//! └──────────────────────┴─────────────────────────────┘
//! ```
//!
//! The AEAD key and nonce come from HKDF-SHA256 over the X25519 shared
//! secret, salted with both public keys. A fresh ephemeral key per seal makes
//! the derived nonce unique without storing one.

use std::fmt;

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore, rngs::OsRng};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Size of X25519 public and secret keys.
pub const KEY_SIZE: usize = 32;

const TAG_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;

/// Bytes added by [`seal`] on top of the plaintext.
pub const SEAL_OVERHEAD: usize = KEY_SIZE + TAG_SIZE;

const DERIVE_INFO: &[u8] = b"cairn epoch derive keypair";
const SEAL_KEY_INFO: &[u8] = b"cairn epoch seal key";
const SEAL_NONCE_INFO: &[u8] = b"cairn epoch seal nonce";

/// X25519 keypair derived from an epoch secret.
///
/// Every holder of the same epoch secret derives the same pair.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    /// Public half, safe to publish
    pub public_key: [u8; KEY_SIZE],
    /// Clamped X25519 scalar
    pub secret_key: [u8; KEY_SIZE],
}

impl fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl DerivedKeys {
    fn check_consistent(&self) -> Result<StaticSecret, CryptoError> {
        if clamp(self.secret_key) != self.secret_key {
            return Err(CryptoError::InvalidKey);
        }

        let secret = StaticSecret::from(self.secret_key);
        if PublicKey::from(&secret).to_bytes() != self.public_key {
            return Err(CryptoError::InvalidKey);
        }
        Ok(secret)
    }
}

/// Derive the epoch keypair from an epoch secret.
pub fn derive_keys(secret: &[u8]) -> Result<DerivedKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(DERIVE_INFO, &mut okm[..]).map_err(|_| CryptoError::InvalidKey)?;

    let secret_key = clamp(*okm);
    let public_key = PublicKey::from(&StaticSecret::from(secret_key)).to_bytes();

    Ok(DerivedKeys { public_key, secret_key })
}

/// Seal `plaintext` for whoever holds the keys, using OS randomness.
pub fn seal(keys: &DerivedKeys, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    seal_to(&keys.public_key, plaintext, &mut OsRng)
}

/// Seal with an explicit randomness source (for deterministic simulation).
pub fn seal_with_rng<R: RngCore + CryptoRng>(
    keys: &DerivedKeys,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, CryptoError> {
    seal_to(&keys.public_key, plaintext, rng)
}

/// Seal to a bare public key.
pub fn seal_to<R: RngCore + CryptoRng>(
    recipient: &[u8; KEY_SIZE],
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(&mut *rng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();

    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }

    let cipher = AeadMaterial::derive(shared.as_bytes(), &ephemeral_public, recipient)?;
    let aad = associated_data(&ephemeral_public, recipient);
    let ciphertext = cipher
        .aead()
        .encrypt(Nonce::from_slice(&cipher.nonce), Payload { msg: plaintext, aad: &aad })
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(KEY_SIZE + ciphertext.len());
    out.extend_from_slice(&ephemeral_public);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a ciphertext produced by [`seal`] for these keys.
pub fn open(keys: &DerivedKeys, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < SEAL_OVERHEAD {
        return Err(CryptoError::CiphertextTooShort { len: ciphertext.len(), min: SEAL_OVERHEAD });
    }
    let secret = keys.check_consistent()?;

    let (ephemeral_bytes, body) = ciphertext.split_at(KEY_SIZE);
    let mut ephemeral_public = [0u8; KEY_SIZE];
    ephemeral_public.copy_from_slice(ephemeral_bytes);

    let shared = secret.diffie_hellman(&PublicKey::from(ephemeral_public));
    if !shared.was_contributory() {
        return Err(CryptoError::Decryption);
    }

    let cipher = AeadMaterial::derive(shared.as_bytes(), &ephemeral_public, &keys.public_key)?;
    let aad = associated_data(&ephemeral_public, &keys.public_key);
    cipher
        .aead()
        .decrypt(Nonce::from_slice(&cipher.nonce), Payload { msg: body, aad: &aad })
        .map_err(|_| CryptoError::Decryption)
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct AeadMaterial {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl AeadMaterial {
    fn derive(
        shared: &[u8; KEY_SIZE],
        ephemeral_public: &[u8; KEY_SIZE],
        recipient: &[u8; KEY_SIZE],
    ) -> Result<Self, CryptoError> {
        let salt = associated_data(ephemeral_public, recipient);
        let hk = Hkdf::<Sha256>::new(Some(&salt), shared);

        let mut material = Self { key: [0u8; KEY_SIZE], nonce: [0u8; NONCE_SIZE] };
        hk.expand(SEAL_KEY_INFO, &mut material.key).map_err(|_| CryptoError::Encryption)?;
        hk.expand(SEAL_NONCE_INFO, &mut material.nonce).map_err(|_| CryptoError::Encryption)?;
        Ok(material)
    }

    fn aead(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }
}

fn associated_data(ephemeral_public: &[u8; KEY_SIZE], recipient: &[u8; KEY_SIZE]) -> [u8; 64] {
    let mut aad = [0u8; 2 * KEY_SIZE];
    aad[..KEY_SIZE].copy_from_slice(ephemeral_public);
    aad[KEY_SIZE..].copy_from_slice(recipient);
    aad
}

fn clamp(mut scalar: [u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    scalar
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn same_secret_derives_same_keys() {
        let a = derive_keys(b"epoch secret").unwrap();
        let b = derive_keys(b"epoch secret").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_secrets_derive_different_keys() {
        let a = derive_keys(&[1u8; 32]).unwrap();
        let b = derive_keys(&[2u8; 32]).unwrap();
        assert_ne!(a.public_key, b.public_key);
    }

    #[test]
    fn other_epoch_cannot_open() {
        let ours = derive_keys(&[1u8; 32]).unwrap();
        let theirs = derive_keys(&[2u8; 32]).unwrap();
        let sealed = seal(&ours, b"hello").unwrap();

        assert_eq!(open(&theirs, &sealed), Err(CryptoError::Decryption));
    }

    #[test]
    fn short_ciphertext_is_rejected() {
        let keys = derive_keys(&[3u8; 32]).unwrap();
        assert!(matches!(
            open(&keys, &[0u8; SEAL_OVERHEAD - 1]),
            Err(CryptoError::CiphertextTooShort { .. })
        ));
    }

    #[test]
    fn seal_to_public_key_opens_with_full_pair() {
        let keys = derive_keys(&[4u8; 32]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let sealed = seal_to(&keys.public_key, b"backlog", &mut rng).unwrap();

        assert_eq!(sealed.len(), b"backlog".len() + SEAL_OVERHEAD);
        assert_eq!(open(&keys, &sealed).unwrap(), b"backlog");
    }

    #[test]
    fn debug_does_not_print_secret() {
        let keys = derive_keys(&[5u8; 32]).unwrap();
        assert!(format!("{keys:?}").contains("<redacted>"));
    }

    proptest! {
        #[test]
        fn open_recovers_sealed_plaintext(
            secret in proptest::collection::vec(any::<u8>(), 1..64),
            plaintext in proptest::collection::vec(any::<u8>(), 0..256),
            seed in any::<u64>(),
        ) {
            let keys = derive_keys(&secret).unwrap();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let sealed = seal_with_rng(&keys, &plaintext, &mut rng).unwrap();

            prop_assert_eq!(open(&keys, &sealed).unwrap(), plaintext);
        }

        #[test]
        fn flipped_ciphertext_byte_fails(
            plaintext in proptest::collection::vec(any::<u8>(), 0..128),
            index in any::<prop::sample::Index>(),
            mask in 1u8..=255,
        ) {
            let keys = derive_keys(b"tamper").unwrap();
            let mut sealed = seal(&keys, &plaintext).unwrap();
            let i = index.index(sealed.len());
            sealed[i] ^= mask;

            prop_assert!(open(&keys, &sealed).is_err());
        }

        #[test]
        fn flipped_key_byte_fails(
            index in 0usize..KEY_SIZE,
            mask in 1u8..=255,
            flip_public in any::<bool>(),
        ) {
            let keys = derive_keys(b"key tamper").unwrap();
            let sealed = seal(&keys, b"payload").unwrap();

            let mut bad = keys.clone();
            if flip_public {
                bad.public_key[index] ^= mask;
            } else {
                bad.secret_key[index] ^= mask;
            }

            prop_assert!(open(&bad, &sealed).is_err());
        }
    }
}
