//! Wire types for Cairn group sessions.
//!
//! Every group-membership change travels through the replicated stream log as
//! one of five MLS event payloads. The log assigns each event an id and a
//! confirmed position; this crate only describes what the payloads contain
//! and how they are encoded.
//!
//! Payloads are CBOR (via `ciborium`) wrapped in a small version header so
//! older clients can refuse events they do not understand instead of
//! misreading them. Application messages are carried in an [`EncryptedData`]
//! envelope tagged with the epoch whose key sealed them.
//!
//! # Security
//!
//! Decoding enforces a 16 MiB limit before touching the CBOR parser. Nothing
//! in this crate handles key material; commit and welcome bytes are opaque
//! and only the MLS engine interprets them.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod event;
pub mod ids;
pub mod payloads;

pub use envelope::{ALGORITHM_MLS, ENVELOPE_VERSION, EncryptedData, MlsCiphertext};
pub use errors::{ProtocolError, Result};
pub use event::{ConfirmedEvent, ConfirmedSnapshot, ContentKind, EncryptedContentItem};
pub use ids::{EventId, StreamId};
pub use payloads::{
    EpochSecret, EpochSecrets, ExternalJoin, InitializeGroup, KeyPackage, MlsPayload,
    PAYLOAD_VERSION, WelcomeMessage,
};
