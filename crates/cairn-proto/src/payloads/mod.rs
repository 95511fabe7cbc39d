//! MLS event payloads carried by the stream log.
//!
//! [`MlsPayload`] is a closed set: every consumer matches it exhaustively, so
//! adding a kind is a compile error everywhere it has to be handled.

mod mls;

use serde::{Deserialize, Serialize};

pub use self::mls::{
    EpochSecret, EpochSecrets, ExternalJoin, InitializeGroup, KeyPackage, WelcomeMessage,
};
use crate::{
    codec,
    errors::{ProtocolError, Result},
};

/// Highest payload revision this build reads and the one it writes.
pub const PAYLOAD_VERSION: u16 = 1;

/// One MLS event as submitted to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MlsPayload {
    /// Creates the group (epoch 0) if nobody has yet
    InitializeGroup(InitializeGroup),
    /// External commit by a client joining without an invitation
    ExternalJoin(ExternalJoin),
    /// Add commit plus welcome for invited members
    WelcomeMessage(WelcomeMessage),
    /// Epoch secrets sealed for later joiners
    EpochSecrets(EpochSecrets),
    /// Published key package so members can add this client
    KeyPackage(KeyPackage),
}

impl MlsPayload {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitializeGroup(_) => "initialize_group",
            Self::ExternalJoin(_) => "external_join",
            Self::WelcomeMessage(_) => "welcome_message",
            Self::EpochSecrets(_) => "epoch_secrets",
            Self::KeyPackage(_) => "key_package",
        }
    }

    /// Encode with the version header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        codec::encode(&VersionedRef { version: PAYLOAD_VERSION, payload: self })
    }

    /// Decode, rejecting payloads from a newer revision before looking at
    /// their body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let probe: VersionProbe = codec::decode(bytes)?;
        if probe.version > PAYLOAD_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: probe.version,
                supported: PAYLOAD_VERSION,
            });
        }

        let versioned: Versioned = codec::decode(bytes)?;
        Ok(versioned.payload)
    }
}

#[derive(Serialize)]
struct VersionedRef<'a> {
    version: u16,
    payload: &'a MlsPayload,
}

#[derive(Deserialize)]
struct Versioned {
    #[allow(dead_code)]
    version: u16,
    payload: MlsPayload,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u16,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample_join() -> MlsPayload {
        MlsPayload::ExternalJoin(ExternalJoin {
            signature_public_key: vec![7; 32],
            commit: vec![1, 2, 3],
            group_info_message: vec![4, 5],
            epoch: 3,
        })
    }

    #[test]
    fn decode_reads_what_encode_writes() {
        let payload = sample_join();
        let bytes = payload.encode().unwrap();
        assert_eq!(MlsPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn newer_version_is_refused() {
        let bytes = codec::encode(&VersionedRef { version: PAYLOAD_VERSION + 1, payload: &sample_join() })
            .unwrap();

        let result = MlsPayload::decode(&bytes);
        assert_eq!(
            result,
            Err(ProtocolError::UnsupportedVersion { found: PAYLOAD_VERSION + 1, supported: PAYLOAD_VERSION })
        );
    }

    #[test]
    fn kind_names_are_distinct() {
        let kinds = [
            MlsPayload::InitializeGroup(InitializeGroup::default()).kind(),
            sample_join().kind(),
            MlsPayload::WelcomeMessage(WelcomeMessage::default()).kind(),
            MlsPayload::EpochSecrets(EpochSecrets::default()).kind(),
            MlsPayload::KeyPackage(KeyPackage::default()).kind(),
        ];
        let unique: std::collections::BTreeSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = MlsPayload::decode(&bytes);
        }
    }
}
