//! CBOR helpers shared by every crate that persists or transmits Cairn types.

use serde::{Serialize, de::DeserializeOwned};

use crate::errors::{ProtocolError, Result};

/// Largest encoded value accepted by [`decode`] (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Serialize `value` as CBOR.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;

    if buf.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge { size: buf.len(), max: MAX_PAYLOAD_SIZE });
    }
    Ok(buf)
}

/// Deserialize a CBOR value, refusing oversized input before parsing.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge { size: bytes.len(), max: MAX_PAYLOAD_SIZE });
    }
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_input_without_parsing() {
        let bytes = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let result: Result<u64> = decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let result: Result<Vec<u64>> = decode(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(ProtocolError::CborDecode(_))));
    }
}
