//! Application ciphertext envelope.

use serde::{Deserialize, Serialize};

use crate::{
    codec,
    errors::{ProtocolError, Result},
};

/// Algorithm tag for MLS epoch encryption.
pub const ALGORITHM_MLS: &str = "mls";

/// Current envelope revision.
pub const ENVELOPE_VERSION: u16 = 1;

/// Ciphertext sealed under one epoch's derived keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlsCiphertext {
    /// Epoch whose keys sealed the message
    pub epoch: u64,

    /// Sealed bytes
    pub ciphertext: Vec<u8>,
}

/// Encrypted application message as stored in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Always [`ALGORITHM_MLS`] for envelopes produced here
    pub algorithm: String,

    /// Envelope revision
    pub version: u16,

    /// Sealed body
    pub mls: MlsCiphertext,
}

impl EncryptedData {
    /// Build an MLS envelope.
    pub fn mls(epoch: u64, ciphertext: Vec<u8>) -> Self {
        Self {
            algorithm: ALGORITHM_MLS.to_owned(),
            version: ENVELOPE_VERSION,
            mls: MlsCiphertext { epoch, ciphertext },
        }
    }

    /// Epoch named by the envelope.
    pub fn epoch(&self) -> u64 {
        self.mls.epoch
    }

    /// Check the envelope is something this build can open.
    pub fn validate(&self) -> Result<()> {
        if self.algorithm != ALGORITHM_MLS {
            return Err(ProtocolError::UnsupportedAlgorithm(self.algorithm.clone()));
        }
        if self.version > ENVELOPE_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: self.version,
                supported: ENVELOPE_VERSION,
            });
        }
        Ok(())
    }

    /// Encode as CBOR.
    pub fn encode(&self) -> Result<Vec<u8>> {
        codec::encode(self)
    }

    /// Decode and validate.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = codec::decode(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mls_envelope_carries_tag_and_epoch() {
        let envelope = EncryptedData::mls(4, vec![9, 9, 9]);
        assert_eq!(envelope.algorithm, "mls");
        assert_eq!(envelope.epoch(), 4);
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn foreign_algorithm_is_rejected_on_decode() {
        let mut envelope = EncryptedData::mls(0, vec![1]);
        envelope.algorithm = "olm".to_owned();
        let bytes = envelope.encode().unwrap();

        assert_eq!(
            EncryptedData::decode(&bytes),
            Err(ProtocolError::UnsupportedAlgorithm("olm".to_owned()))
        );
    }
}
