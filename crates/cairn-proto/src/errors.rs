//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Encoded value exceeds [`crate::codec::MAX_PAYLOAD_SIZE`]
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Size of the rejected input
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Payload was written by a newer protocol revision
    #[error("unsupported payload version {found} (supported up to {supported})")]
    UnsupportedVersion {
        /// Version found on the wire
        found: u16,
        /// Highest version this build understands
        supported: u16,
    },

    /// Envelope names an encryption algorithm other than MLS
    #[error("unsupported envelope algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// CBOR serialization failed
    #[error("CBOR encoding failed: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decoding failed: {0}")]
    CborDecode(String),
}
