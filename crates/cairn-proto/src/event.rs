//! Confirmed log entries as seen by a client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    ids::{EventId, StreamId},
    payloads::MlsPayload,
};

/// An MLS event after the log has ordered it.
///
/// Confirmed events are immutable. Consumers process them in ascending
/// `confirmed_event_num`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedEvent {
    /// Log-assigned identifier
    pub event_id: EventId,

    /// Position in the stream's confirmed order
    pub confirmed_event_num: u64,

    /// Miniblock the event was sealed into
    pub miniblock_num: u64,

    /// Event body; `None` when the log carried no MLS content
    pub payload: Option<MlsPayload>,
}

impl ConfirmedEvent {
    /// Payload kind for logs.
    pub fn kind(&self) -> &'static str {
        self.payload.as_ref().map_or("empty", MlsPayload::kind)
    }
}

/// Compacted MLS state embedded in a miniblock header.
///
/// Every confirmed event at or below `confirmed_event_num` is already folded
/// into the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedSnapshot {
    /// Last confirmed event folded into this snapshot
    pub confirmed_event_num: u64,

    /// Miniblock carrying the snapshot
    pub miniblock_num: u64,

    /// Serialized observer group; empty before the group exists
    pub external_group_snapshot: Vec<u8>,

    /// Latest group info message
    pub group_info_message: Vec<u8>,

    /// Sealed epoch secrets announced before compaction
    pub sealed_epoch_secrets: BTreeMap<u64, Vec<u8>>,
}

impl ConfirmedSnapshot {
    /// Whether the snapshot carries a group at all.
    pub fn has_group(&self) -> bool {
        !self.external_group_snapshot.is_empty() && !self.group_info_message.is_empty()
    }
}

/// Kind of application content awaiting decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentKind {
    /// Channel or DM message body
    Message,
    /// Message edit
    Edit,
    /// Reaction or other small annotation
    Reaction,
}

/// Encrypted application content delivered alongside MLS events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedContentItem {
    /// Stream the content belongs to
    pub stream_id: StreamId,

    /// Event carrying the content
    pub event_id: EventId,

    /// What the plaintext represents
    pub kind: ContentKind,

    /// Epoch named by the envelope
    pub epoch: u64,

    /// Ciphertext produced by epoch encryption
    pub ciphertext: Vec<u8>,
}
