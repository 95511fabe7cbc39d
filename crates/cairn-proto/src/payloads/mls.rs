//! MLS event payload bodies.
//!
//! These types wrap raw MLS protocol data. Commits, group info and welcomes
//! are opaque here; the group engine in `cairn-core` interprets them.

use serde::{Deserialize, Serialize};

/// Group creation
///
/// # Protocol Flow
///
/// Any client that finds no group on the stream creates one locally at epoch
/// 0 and publishes enough public state for everyone else to follow along:
/// 1. Client creates group and exports its public state
/// 2. Log orders all concurrent InitializeGroup events
/// 3. The first one confirmed wins; later ones are rejected by every observer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeGroup {
    /// Creator's signature public key
    pub signature_public_key: Vec<u8>,

    /// Serialized observer snapshot of the new group
    pub external_group_snapshot: Vec<u8>,

    /// Group info message carrying the external-join key
    pub group_info_message: Vec<u8>,
}

/// External join
///
/// # Protocol Flow
///
/// A client that is not a member builds an external commit from the latest
/// confirmed group info and exported tree:
/// 1. Client commits against epoch N
/// 2. Log orders the commit
/// 3. The first valid commit for epoch N is accepted; any other commit for N
///    no longer applies and is rejected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalJoin {
    /// Joiner's signature public key
    pub signature_public_key: Vec<u8>,

    /// Serialized external commit
    pub commit: Vec<u8>,

    /// Group info after the commit, for the next external joiner
    pub group_info_message: Vec<u8>,

    /// Epoch the commit was built against
    pub epoch: u64,
}

/// Add commit with welcome
///
/// Sent by an existing member who adds one or more published key packages.
/// Observers treat the commit exactly like an external join; invited clients
/// use the welcome instead of committing themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    /// Committer's signature public key
    pub signature_public_key: Vec<u8>,

    /// Serialized add commit
    pub commit: Vec<u8>,

    /// Group info after the commit
    pub group_info_message: Vec<u8>,

    /// One serialized welcome per added member
    pub welcome_messages: Vec<Vec<u8>>,
}

/// Sealed epoch secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochSecret {
    /// Epoch whose secret is sealed
    pub epoch: u64,

    /// Secret sealed under keys derived from the following epoch
    pub secret: Vec<u8>,
}

/// Epoch secret announcement
///
/// Members seal old epoch secrets so that clients joining later can still
/// decrypt history. Always accepted by observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochSecrets {
    /// Sealed secrets, one per epoch
    pub secrets: Vec<EpochSecret>,
}

/// Key package publication
///
/// Ignored by reconciliation; members read it when they want to add the
/// publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPackage {
    /// Publisher's signature public key
    pub signature_public_key: Vec<u8>,

    /// Serialized key package
    pub key_package: Vec<u8>,
}
