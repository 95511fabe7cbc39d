//! Fuzzer for MLS payload decoding
//!
//! Payloads arrive from the log, written by any client. Decoding arbitrary
//! bytes must never panic, and whatever decodes must survive re-encoding.

#![no_main]

use cairn_proto::MlsPayload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = MlsPayload::decode(data) else {
        return;
    };

    let encoded = payload.encode().expect("decoded payload must re-encode");
    let decoded = MlsPayload::decode(&encoded).expect("re-encoded payload must decode");
    assert_eq!(decoded, payload, "payload changed across re-encoding");
});
