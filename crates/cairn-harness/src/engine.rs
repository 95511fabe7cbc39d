//! Simulated MLS engine.
//!
//! Not MLS, but shaped like it where reconciliation can tell the difference:
//!
//! - A group advances by exactly one epoch per commit, and a commit only
//!   applies to the epoch and transcript it was built against. Two commits
//!   built on the same epoch therefore conflict; whichever applies first
//!   forks the transcript away from the other.
//! - Observers validate commits structurally. Members additionally derive
//!   the next epoch secret, which for an external commit means opening the
//!   joiner's init secret with the epoch's external key.
//! - Welcomes are sealed to a key package's public key and only join on the
//!   client holding it.
//!
//! Key schedule: `secret' = HKDF(salt = transcript', ikm)` where `ikm` is the
//! previous secret (add) or the joiner's init secret (external commit), and
//! `transcript' = SHA-256(transcript || commit)`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use cairn_core::{
    AddMemberOutput, EngineError, Environment, ExternalGroupSession, ExternalJoinOutput,
    GroupEngine, GroupSession, ProcessedMessage,
};
use cairn_crypto::{DerivedKeys, KEY_SIZE, derive_keys, open, seal_to};
use cairn_proto::codec;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::sim_env::EnvRng;

const EPOCH_INFO: &[u8] = b"cairn-sim epoch secret";
const EXTERNAL_INFO: &[u8] = b"cairn-sim external key";

type Transcript = [u8; 32];

/// Public group state, what an observer holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PublicState {
    group_id: Vec<u8>,
    epoch: u64,
    transcript: Transcript,
    members: Vec<Vec<u8>>,
}

impl PublicState {
    /// Validate a commit and return the state after it.
    fn apply(&self, commit: &Commit, commit_bytes: &[u8]) -> Result<Self, EngineError> {
        if commit.group_id != self.group_id {
            return Err(EngineError::InvalidCommit("commit for another group".into()));
        }
        if commit.epoch != self.epoch {
            return Err(EngineError::EpochMismatch {
                commit_epoch: commit.epoch,
                group_epoch: self.epoch,
            });
        }
        if commit.parent_transcript != self.transcript {
            return Err(EngineError::InvalidCommit("commit built on a different transcript".into()));
        }

        let mut members = self.members.clone();
        let member = commit.body.member();
        if !members.iter().any(|m| m == member) {
            members.push(member.to_vec());
        }

        Ok(Self {
            group_id: self.group_id.clone(),
            epoch: self.epoch + 1,
            transcript: next_transcript(&self.transcript, commit_bytes),
            members,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Commit {
    group_id: Vec<u8>,
    epoch: u64,
    parent_transcript: Transcript,
    body: CommitBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CommitBody {
    External { joiner: Vec<u8>, sealed_init: Vec<u8> },
    Add { member: Vec<u8> },
}

impl CommitBody {
    fn member(&self) -> &[u8] {
        match self {
            Self::External { joiner, .. } => joiner,
            Self::Add { member } => member,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupInfo {
    public: PublicState,
    external_pub: Option<[u8; KEY_SIZE]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyPackageBody {
    signature_key: Vec<u8>,
    init_key: [u8; KEY_SIZE],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Welcome {
    init_key: [u8; KEY_SIZE],
    sealed_state: Vec<u8>,
}

#[derive(Clone, Serialize, Deserialize)]
struct MemberState {
    public: PublicState,
    epoch_secret: Vec<u8>,
    pending: Option<PendingCommit>,
}

/// Our own commit, staged until the log confirms it.
#[derive(Clone, Serialize, Deserialize)]
struct PendingCommit {
    commit: Vec<u8>,
    public: PublicState,
    epoch_secret: Vec<u8>,
}

fn next_transcript(parent: &Transcript, commit: &[u8]) -> Transcript {
    let mut hasher = Sha256::new();
    hasher.update(parent);
    hasher.update(commit);
    hasher.finalize().into()
}

fn next_epoch_secret(ikm: &[u8], transcript: &Transcript) -> Result<Vec<u8>, EngineError> {
    let mut okm = vec![0u8; 32];
    Hkdf::<Sha256>::new(Some(transcript.as_slice()), ikm)
        .expand(EPOCH_INFO, &mut okm)
        .map_err(|_| EngineError::InvalidState("epoch secret expansion failed".into()))?;
    Ok(okm)
}

fn external_keys(epoch_secret: &[u8]) -> Result<DerivedKeys, EngineError> {
    let mut seed = [0u8; 32];
    Hkdf::<Sha256>::new(None, epoch_secret)
        .expand(EXTERNAL_INFO, &mut seed)
        .map_err(|_| EngineError::InvalidState("external key expansion failed".into()))?;
    Ok(derive_keys(&seed)?)
}

fn random_vec<Env: Environment>(env: &Env, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    env.random_bytes(&mut bytes);
    bytes
}

/// Simulated engine for one client identity.
///
/// Clones share the key package store, so a restarted client can still
/// accept welcomes addressed to key packages it published before.
#[derive(Clone)]
pub struct SimEngine<Env> {
    env: Env,
    identity: Vec<u8>,
    key_packages: Arc<Mutex<HashMap<[u8; KEY_SIZE], Vec<u8>>>>,
}

impl<Env: Environment> SimEngine<Env> {
    /// Create an engine with a fresh identity drawn from `env`.
    pub fn new(env: Env) -> Self {
        let identity = random_vec(&env, 32);
        Self { env, identity, key_packages: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Build an external commit whose init secret is sealed to the wrong key.
    ///
    /// Observers accept it and the committer's own group is consistent with
    /// it, but existing members cannot derive the next epoch from it.
    pub fn external_commit_with_bad_init(
        &self,
        group_info: &[u8],
        exported_tree: &[u8],
    ) -> Result<ExternalJoinOutput<SimGroup<Env>>, EngineError> {
        let info = decode_group_info(group_info, exported_tree)?;
        let wrong_key = external_keys(&random_vec(&self.env, 32))?;
        let init_secret = random_vec(&self.env, 32);
        let sealed_init =
            seal_to(&wrong_key.public_key, &init_secret, &mut EnvRng(self.env.clone()))?;

        let commit = Commit {
            group_id: info.public.group_id.clone(),
            epoch: info.public.epoch,
            parent_transcript: info.public.transcript,
            body: CommitBody::External { joiner: self.identity.clone(), sealed_init },
        };
        let commit_bytes = codec::encode(&commit)?;
        let public = info.public.apply(&commit, &commit_bytes)?;
        let epoch_secret = next_epoch_secret(&init_secret, &public.transcript)?;

        let group = SimGroup {
            state: MemberState { public, epoch_secret, pending: None },
            env: self.env.clone(),
        };
        Ok(ExternalJoinOutput { group, commit: commit_bytes })
    }

    /// Number of unused key packages.
    pub fn key_package_count(&self) -> usize {
        self.key_packages.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn decode_group_info(group_info: &[u8], exported_tree: &[u8]) -> Result<GroupInfo, EngineError> {
    let info: GroupInfo = codec::decode(group_info)?;
    let members: Vec<Vec<u8>> = codec::decode(exported_tree)?;
    if members != info.public.members {
        return Err(EngineError::InvalidState("tree does not match group info".into()));
    }
    Ok(info)
}

#[async_trait]
impl<Env: Environment> GroupEngine for SimEngine<Env> {
    type Group = SimGroup<Env>;
    type ExternalGroup = SimExternalGroup;

    fn signature_public_key(&self) -> Vec<u8> {
        self.identity.clone()
    }

    async fn create_group(&self) -> Result<Self::Group, EngineError> {
        let group_id = random_vec(&self.env, 16);
        let transcript: Transcript = Sha256::digest(&group_id).into();
        let state = MemberState {
            public: PublicState {
                group_id,
                epoch: 0,
                transcript,
                members: vec![self.identity.clone()],
            },
            epoch_secret: random_vec(&self.env, 32),
            pending: None,
        };
        Ok(SimGroup { state, env: self.env.clone() })
    }

    async fn commit_external(
        &self,
        group_info: &[u8],
        exported_tree: &[u8],
    ) -> Result<ExternalJoinOutput<Self::Group>, EngineError> {
        let info = decode_group_info(group_info, exported_tree)?;
        let external_pub = info
            .external_pub
            .ok_or_else(|| EngineError::InvalidState("group info carries no external key".into()))?;

        let init_secret = random_vec(&self.env, 32);
        let sealed_init = seal_to(&external_pub, &init_secret, &mut EnvRng(self.env.clone()))?;

        let commit = Commit {
            group_id: info.public.group_id.clone(),
            epoch: info.public.epoch,
            parent_transcript: info.public.transcript,
            body: CommitBody::External { joiner: self.identity.clone(), sealed_init },
        };
        let commit_bytes = codec::encode(&commit)?;
        let public = info.public.apply(&commit, &commit_bytes)?;
        let epoch_secret = next_epoch_secret(&init_secret, &public.transcript)?;

        let group = SimGroup {
            state: MemberState { public, epoch_secret, pending: None },
            env: self.env.clone(),
        };
        Ok(ExternalJoinOutput { group, commit: commit_bytes })
    }

    async fn join_group(&self, welcome: &[u8]) -> Result<Self::Group, EngineError> {
        let welcome: Welcome = codec::decode(welcome)?;
        let seed = self
            .key_packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&welcome.init_key)
            .cloned()
            .ok_or(EngineError::NoMatchingKeyPackage)?;

        let keys = derive_keys(&seed)?;
        let state: MemberState = codec::decode(&open(&keys, &welcome.sealed_state)?)?;

        self.key_packages.lock().unwrap_or_else(PoisonError::into_inner).remove(&welcome.init_key);
        Ok(SimGroup { state, env: self.env.clone() })
    }

    async fn load_external_group(&self, snapshot: &[u8]) -> Result<Self::ExternalGroup, EngineError> {
        Ok(SimExternalGroup { public: codec::decode(snapshot)? })
    }

    async fn load_group(&self, state: &[u8]) -> Result<Self::Group, EngineError> {
        Ok(SimGroup { state: codec::decode(state)?, env: self.env.clone() })
    }

    async fn generate_key_package(&self) -> Result<Vec<u8>, EngineError> {
        let seed = random_vec(&self.env, 32);
        let keys = derive_keys(&seed)?;
        self.key_packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(keys.public_key, seed);

        let body = KeyPackageBody { signature_key: self.identity.clone(), init_key: keys.public_key };
        Ok(codec::encode(&body)?)
    }
}

/// Member group.
pub struct SimGroup<Env> {
    state: MemberState,
    env: Env,
}

impl<Env> SimGroup<Env> {
    /// Signature keys of the current members.
    pub fn members(&self) -> &[Vec<u8>] {
        &self.state.public.members
    }

    /// Whether an own commit is staged.
    pub fn has_pending_commit(&self) -> bool {
        self.state.pending.is_some()
    }
}

#[async_trait]
impl<Env: Environment> GroupSession for SimGroup<Env> {
    fn group_id(&self) -> Vec<u8> {
        self.state.public.group_id.clone()
    }

    fn epoch(&self) -> u64 {
        self.state.public.epoch
    }

    fn current_epoch_secret(&self) -> Result<Vec<u8>, EngineError> {
        Ok(self.state.epoch_secret.clone())
    }

    fn export_tree(&self) -> Result<Vec<u8>, EngineError> {
        Ok(codec::encode(&self.state.public.members)?)
    }

    fn group_info_message(&self, allow_external_commit: bool) -> Result<Vec<u8>, EngineError> {
        let external_pub = if allow_external_commit {
            Some(external_keys(&self.state.epoch_secret)?.public_key)
        } else {
            None
        };
        let info = GroupInfo { public: self.state.public.clone(), external_pub };
        Ok(codec::encode(&info)?)
    }

    fn external_group_snapshot(&self) -> Result<Vec<u8>, EngineError> {
        Ok(codec::encode(&self.state.public)?)
    }

    fn export_state(&self) -> Result<Vec<u8>, EngineError> {
        Ok(codec::encode(&self.state)?)
    }

    async fn process_incoming_message(
        &mut self,
        message: &[u8],
    ) -> Result<ProcessedMessage, EngineError> {
        if let Some(pending) = self.state.pending.take_if(|p| p.commit == message) {
            self.state =
                MemberState { public: pending.public, epoch_secret: pending.epoch_secret, pending: None };
            return Ok(ProcessedMessage::Commit { epoch: self.state.public.epoch });
        }

        let commit: Commit = codec::decode(message)?;
        let public = self.state.public.apply(&commit, message)?;
        let epoch_secret = match &commit.body {
            CommitBody::External { sealed_init, .. } => {
                let keys = external_keys(&self.state.epoch_secret)?;
                let init_secret = open(&keys, sealed_init)?;
                next_epoch_secret(&init_secret, &public.transcript)?
            },
            CommitBody::Add { .. } => next_epoch_secret(&self.state.epoch_secret, &public.transcript)?,
        };

        self.state = MemberState { public, epoch_secret, pending: None };
        Ok(ProcessedMessage::Commit { epoch: self.state.public.epoch })
    }

    async fn add_member(&mut self, key_package: &[u8]) -> Result<AddMemberOutput, EngineError> {
        let key_package: KeyPackageBody = codec::decode(key_package)?;
        let current = &self.state.public;

        let commit = Commit {
            group_id: current.group_id.clone(),
            epoch: current.epoch,
            parent_transcript: current.transcript,
            body: CommitBody::Add { member: key_package.signature_key },
        };
        let commit_bytes = codec::encode(&commit)?;
        let public = current.apply(&commit, &commit_bytes)?;
        let epoch_secret = next_epoch_secret(&self.state.epoch_secret, &public.transcript)?;

        let joined = MemberState { public: public.clone(), epoch_secret: epoch_secret.clone(), pending: None };
        let sealed_state =
            seal_to(&key_package.init_key, &codec::encode(&joined)?, &mut EnvRng(self.env.clone()))?;
        let welcome = Welcome { init_key: key_package.init_key, sealed_state };

        let group_info = GroupInfo {
            public: public.clone(),
            external_pub: Some(external_keys(&epoch_secret)?.public_key),
        };

        let output = AddMemberOutput {
            commit: commit_bytes.clone(),
            welcome: codec::encode(&welcome)?,
            group_info: codec::encode(&group_info)?,
        };
        self.state.pending = Some(PendingCommit { commit: commit_bytes, public, epoch_secret });
        Ok(output)
    }
}

/// Observer group.
pub struct SimExternalGroup {
    public: PublicState,
}

#[async_trait]
impl ExternalGroupSession for SimExternalGroup {
    fn epoch(&self) -> u64 {
        self.public.epoch
    }

    fn export_tree(&self) -> Result<Vec<u8>, EngineError> {
        Ok(codec::encode(&self.public.members)?)
    }

    fn snapshot(&self) -> Result<Vec<u8>, EngineError> {
        Ok(codec::encode(&self.public)?)
    }

    async fn process_incoming_message(&mut self, commit: &[u8]) -> Result<(), EngineError> {
        let decoded: Commit = codec::decode(commit)?;
        self.public = self.public.apply(&decoded, commit)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_env::SimEnv;

    fn engine(seed: u64) -> SimEngine<SimEnv> {
        SimEngine::new(SimEnv::with_seed(seed))
    }

    async fn observer_of(engine: &SimEngine<SimEnv>, group: &SimGroup<SimEnv>) -> SimExternalGroup {
        engine.load_external_group(&group.external_group_snapshot().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn external_join_agrees_on_next_secret() {
        let alice = engine(1);
        let bob = engine(2);

        let mut group = alice.create_group().await.unwrap();
        let joined = bob
            .commit_external(&group.group_info_message(true).unwrap(), &group.export_tree().unwrap())
            .await
            .unwrap();

        let processed = group.process_incoming_message(&joined.commit).await.unwrap();
        assert_eq!(processed, ProcessedMessage::Commit { epoch: 1 });
        assert_eq!(joined.group.epoch(), 1);
        assert_eq!(group.current_epoch_secret().unwrap(), joined.group.current_epoch_secret().unwrap());
        assert_eq!(group.members().len(), 2);
    }

    #[tokio::test]
    async fn second_commit_on_same_epoch_is_rejected() {
        let alice = engine(1);
        let group = alice.create_group().await.unwrap();
        let info = group.group_info_message(true).unwrap();
        let tree = group.export_tree().unwrap();

        let first = engine(2).commit_external(&info, &tree).await.unwrap();
        let second = engine(3).commit_external(&info, &tree).await.unwrap();

        let mut observer = observer_of(&alice, &group).await;
        observer.process_incoming_message(&first.commit).await.unwrap();
        let err = observer.process_incoming_message(&second.commit).await.unwrap_err();
        assert!(matches!(err, EngineError::EpochMismatch { commit_epoch: 0, group_epoch: 1 }));
        assert_eq!(observer.epoch(), 1);
    }

    #[tokio::test]
    async fn failed_commit_leaves_group_unchanged() {
        let alice = engine(1);
        let mut group = alice.create_group().await.unwrap();
        let before = group.export_state().unwrap();

        let bad = engine(2)
            .external_commit_with_bad_init(
                &group.group_info_message(true).unwrap(),
                &group.export_tree().unwrap(),
            )
            .unwrap()
            .commit;

        let mut observer = observer_of(&alice, &group).await;
        observer.process_incoming_message(&bad).await.unwrap();

        assert!(group.process_incoming_message(&bad).await.is_err());
        assert_eq!(group.export_state().unwrap(), before);
    }

    #[tokio::test]
    async fn own_add_commit_merges_and_welcome_joins() {
        let alice = engine(1);
        let bob = engine(2);

        let mut group = alice.create_group().await.unwrap();
        let key_package = bob.generate_key_package().await.unwrap();
        let added = group.add_member(&key_package).await.unwrap();
        assert!(group.has_pending_commit());
        assert_eq!(group.epoch(), 0);

        group.process_incoming_message(&added.commit).await.unwrap();
        assert!(!group.has_pending_commit());
        assert_eq!(group.epoch(), 1);

        let joined = bob.join_group(&added.welcome).await.unwrap();
        assert_eq!(joined.epoch(), 1);
        assert_eq!(joined.current_epoch_secret().unwrap(), group.current_epoch_secret().unwrap());
        assert_eq!(bob.key_package_count(), 0);
    }

    #[tokio::test]
    async fn welcome_for_someone_else_does_not_match() {
        let alice = engine(1);
        let mut group = alice.create_group().await.unwrap();
        let added = group.add_member(&engine(2).generate_key_package().await.unwrap()).await.unwrap();

        let err = engine(3).join_group(&added.welcome).await.err();
        assert_eq!(err, Some(EngineError::NoMatchingKeyPackage));
    }

    #[tokio::test]
    async fn foreign_commit_discards_pending_commit() {
        let alice = engine(1);
        let mut group = alice.create_group().await.unwrap();
        let info = group.group_info_message(true).unwrap();
        let tree = group.export_tree().unwrap();

        group.add_member(&engine(2).generate_key_package().await.unwrap()).await.unwrap();
        let external = engine(3).commit_external(&info, &tree).await.unwrap();

        group.process_incoming_message(&external.commit).await.unwrap();
        assert!(!group.has_pending_commit());
        assert_eq!(group.epoch(), 1);
    }

    #[tokio::test]
    async fn state_round_trips_through_export() {
        let alice = engine(1);
        let group = alice.create_group().await.unwrap();
        let restored = alice.load_group(&group.export_state().unwrap()).await.unwrap();

        assert_eq!(restored.group_id(), group.group_id());
        assert_eq!(restored.current_epoch_secret().unwrap(), group.current_epoch_secret().unwrap());
    }
}
