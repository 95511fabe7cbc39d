use async_trait::async_trait;

use crate::error::EngineError;

/// Result of handing a message to a member group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedMessage {
    /// A commit was applied; the group is now at `epoch`
    Commit {
        /// Epoch after the commit
        epoch: u64,
    },
    /// An application message was decrypted
    Application(Vec<u8>),
}

/// Group created by an external commit, plus the commit to publish.
pub struct ExternalJoinOutput<G> {
    /// Our group, already at the post-commit epoch
    pub group: G,
    /// Commit to submit as an ExternalJoin event
    pub commit: Vec<u8>,
}

/// Output of adding a member by key package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddMemberOutput {
    /// Add commit; stays pending in our group until confirmed
    pub commit: Vec<u8>,
    /// Welcome for the added member
    pub welcome: Vec<u8>,
    /// Group info after the commit
    pub group_info: Vec<u8>,
}

/// Factory for groups owned by one client identity.
///
/// # Contract
///
/// A failed operation leaves existing groups untouched. In particular a
/// commit that does not apply must not advance or otherwise alter the group
/// it was handed to.
#[async_trait]
pub trait GroupEngine: Send + Sync + 'static {
    /// Member group type.
    type Group: GroupSession;

    /// Observer (non-member) group type.
    type ExternalGroup: ExternalGroupSession;

    /// This client's signature public key.
    fn signature_public_key(&self) -> Vec<u8>;

    /// Create a fresh single-member group at epoch 0.
    async fn create_group(&self) -> Result<Self::Group, EngineError>;

    /// Build an external commit against published group info and tree.
    async fn commit_external(
        &self,
        group_info: &[u8],
        exported_tree: &[u8],
    ) -> Result<ExternalJoinOutput<Self::Group>, EngineError>;

    /// Join a group from a welcome addressed to one of our key packages.
    async fn join_group(&self, welcome: &[u8]) -> Result<Self::Group, EngineError>;

    /// Load an observer group from a serialized snapshot.
    async fn load_external_group(&self, snapshot: &[u8]) -> Result<Self::ExternalGroup, EngineError>;

    /// Restore a member group from [`GroupSession::export_state`] output.
    async fn load_group(&self, state: &[u8]) -> Result<Self::Group, EngineError>;

    /// Generate a key package others can add us with.
    async fn generate_key_package(&self) -> Result<Vec<u8>, EngineError>;
}

/// A group this client is a member of.
#[async_trait]
pub trait GroupSession: Send + Sync + 'static {
    /// Group identifier.
    fn group_id(&self) -> Vec<u8>;

    /// Current epoch; increases by exactly one per applied commit.
    fn epoch(&self) -> u64;

    /// Secret for the current epoch.
    fn current_epoch_secret(&self) -> Result<Vec<u8>, EngineError>;

    /// Exported ratchet tree.
    fn export_tree(&self) -> Result<Vec<u8>, EngineError>;

    /// Group info message, optionally carrying the external-join key.
    fn group_info_message(&self, allow_external_commit: bool) -> Result<Vec<u8>, EngineError>;

    /// Observer snapshot other clients can load with
    /// [`GroupEngine::load_external_group`].
    fn external_group_snapshot(&self) -> Result<Vec<u8>, EngineError>;

    /// Serialized private state for [`GroupEngine::load_group`].
    fn export_state(&self) -> Result<Vec<u8>, EngineError>;

    /// Apply a commit or decrypt an application message.
    ///
    /// Processing our own pending commit merges it.
    async fn process_incoming_message(
        &mut self,
        message: &[u8],
    ) -> Result<ProcessedMessage, EngineError>;

    /// Stage an add commit for a key package.
    async fn add_member(&mut self, key_package: &[u8]) -> Result<AddMemberOutput, EngineError>;
}

/// A non-member view of a group's public state.
#[async_trait]
pub trait ExternalGroupSession: Send + Sync + 'static {
    /// Current epoch.
    fn epoch(&self) -> u64;

    /// Exported ratchet tree.
    fn export_tree(&self) -> Result<Vec<u8>, EngineError>;

    /// Serialized observer snapshot.
    fn snapshot(&self) -> Result<Vec<u8>, EngineError>;

    /// Validate and apply a commit.
    async fn process_incoming_message(&mut self, commit: &[u8]) -> Result<(), EngineError>;
}
