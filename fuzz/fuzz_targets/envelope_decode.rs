//! Fuzzer for encrypted content envelopes
//!
//! `EncryptedData::decode` validates as it decodes, so anything it returns
//! must name the MLS algorithm and a supported version.

#![no_main]

use cairn_proto::{EncryptedData, ALGORITHM_MLS};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = EncryptedData::decode(data) else {
        return;
    };

    assert_eq!(envelope.algorithm, ALGORITHM_MLS);
    assert!(envelope.validate().is_ok(), "decoded envelope failed validation");

    let encoded = envelope.encode().expect("decoded envelope must re-encode");
    assert_eq!(EncryptedData::decode(&encoded).ok(), Some(envelope));
});
