//! Log-derived view of a stream's group.
//!
//! # Verdicts
//!
//! | Event            | Accepted when                                         |
//! |------------------|-------------------------------------------------------|
//! | InitializeGroup  | no group loaded yet and its snapshot loads            |
//! | ExternalJoin     | a group is loaded and the commit applies              |
//! | WelcomeMessage   | same as ExternalJoin                                  |
//! | EpochSecrets     | always                                                |
//! | KeyPackage/empty | never recorded                                        |
//!
//! Commits are keyed by the epoch they were applied to (the pre-commit
//! epoch). Because a commit only applies to the epoch it was built for, at
//! most one accepted event advances the group per epoch, and every client
//! replaying the same confirmed order reaches the same verdicts.

use std::collections::BTreeMap;

use cairn_proto::{ConfirmedEvent, ConfirmedSnapshot, EpochSecrets, EventId, MlsPayload};

use crate::{
    error::EngineError,
    log::StreamHistory,
    mls::{ExternalGroupSession, GroupEngine},
};

struct RemoteGroup<X> {
    group: X,
    group_info_with_external_key: Vec<u8>,
}

/// Public state an external joiner needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteGroupInfo {
    /// Exported ratchet tree of the confirmed group
    pub exported_tree: Vec<u8>,
    /// Group info from the latest accepted event
    pub latest_group_info: Vec<u8>,
    /// Confirmed epoch
    pub epoch: u64,
}

/// Comparable summary of a Remote View.
///
/// Two clients that processed the same confirmed events produce equal
/// digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteViewDigest {
    /// Accepted event ids
    pub accepted: Vec<EventId>,
    /// Rejected event ids
    pub rejected: Vec<EventId>,
    /// Commits by pre-commit epoch
    pub commits: BTreeMap<u64, Vec<u8>>,
    /// Sealed epoch secrets by epoch
    pub sealed_epoch_secrets: BTreeMap<u64, Vec<u8>>,
    /// External join info, if a group exists
    pub external_info: Option<RemoteGroupInfo>,
}

/// Confirmed-log view of one stream's group.
pub struct RemoteView<E: GroupEngine> {
    remote_group: Option<RemoteGroup<E::ExternalGroup>>,
    accepted: BTreeMap<EventId, ConfirmedEvent>,
    rejected: BTreeMap<EventId, ConfirmedEvent>,
    commits: BTreeMap<u64, Vec<u8>>,
    sealed_epoch_secrets: BTreeMap<u64, Vec<u8>>,
    last_confirmed_event_num: Option<u64>,
    last_snapshot_event_num: Option<u64>,
    span: tracing::Span,
}

impl<E: GroupEngine> RemoteView<E> {
    /// Create an empty view. Log output is attributed to `span`.
    pub fn new(span: tracing::Span) -> Self {
        Self {
            remote_group: None,
            accepted: BTreeMap::new(),
            rejected: BTreeMap::new(),
            commits: BTreeMap::new(),
            sealed_epoch_secrets: BTreeMap::new(),
            last_confirmed_event_num: None,
            last_snapshot_event_num: None,
            span,
        }
    }

    /// Rebuild a view from log history.
    ///
    /// Applies the snapshot, then every event confirmed strictly after it in
    /// ascending order.
    pub async fn load_from_log(engine: &E, history: &StreamHistory, span: tracing::Span) -> Self {
        let mut view = Self::new(span);

        let floor = history.snapshot.as_ref().map(|s| s.confirmed_event_num);
        if let Some(snapshot) = &history.snapshot {
            view.process_snapshot(engine, snapshot).await;
        }

        let mut events: Vec<&ConfirmedEvent> = history
            .events
            .iter()
            .filter(|e| floor.is_none_or(|floor| e.confirmed_event_num > floor))
            .collect();
        events.sort_by_key(|e| e.confirmed_event_num);

        for event in events {
            view.process_confirmed_event(engine, event.clone()).await;
        }
        view
    }

    /// Reload the observer group from a compaction snapshot.
    ///
    /// A snapshot older than the last snapshot applied, or older than any
    /// event already processed, is ignored: loading it would roll the group
    /// back to an epoch that already has a commit. A snapshot that fails to
    /// load is logged and leaves the view unchanged.
    pub async fn process_snapshot(&mut self, engine: &E, snapshot: &ConfirmedSnapshot) {
        if let Some(last) = self.last_snapshot_event_num
            && snapshot.confirmed_event_num < last
        {
            tracing::warn!(
                parent: &self.span,
                snapshot = snapshot.confirmed_event_num,
                last,
                "ignoring snapshot older than the last one applied"
            );
            return;
        }
        if let Some(last) = self.last_confirmed_event_num
            && snapshot.confirmed_event_num < last
        {
            tracing::warn!(
                parent: &self.span,
                snapshot = snapshot.confirmed_event_num,
                last,
                "ignoring snapshot older than events already processed"
            );
            return;
        }

        for (epoch, sealed) in &snapshot.sealed_epoch_secrets {
            self.sealed_epoch_secrets.entry(*epoch).or_insert_with(|| sealed.clone());
        }

        if !snapshot.has_group() {
            self.last_snapshot_event_num = Some(snapshot.confirmed_event_num);
            return;
        }

        match engine.load_external_group(&snapshot.external_group_snapshot).await {
            Ok(group) => {
                tracing::debug!(
                    parent: &self.span,
                    confirmed_event_num = snapshot.confirmed_event_num,
                    miniblock_num = snapshot.miniblock_num,
                    epoch = group.epoch(),
                    "loaded group from snapshot"
                );
                self.remote_group = Some(RemoteGroup {
                    group,
                    group_info_with_external_key: snapshot.group_info_message.clone(),
                });
                self.last_snapshot_event_num = Some(snapshot.confirmed_event_num);
                self.last_confirmed_event_num = Some(snapshot.confirmed_event_num);
            },
            Err(e) => {
                tracing::error!(
                    parent: &self.span,
                    confirmed_event_num = snapshot.confirmed_event_num,
                    error = %e,
                    "failed to load group snapshot"
                );
            },
        }
    }

    /// Replay one confirmed event.
    ///
    /// Already-processed event ids are ignored. An event numbered at or below
    /// the last one seen is logged but still processed.
    pub async fn process_confirmed_event(&mut self, engine: &E, event: ConfirmedEvent) {
        if self.accepted.contains_key(&event.event_id) || self.rejected.contains_key(&event.event_id)
        {
            tracing::trace!(parent: &self.span, event_id = %event.event_id, "event already processed");
            return;
        }

        tracing::debug!(
            parent: &self.span,
            event_id = %event.event_id,
            confirmed_event_num = event.confirmed_event_num,
            miniblock_num = event.miniblock_num,
            kind = event.kind(),
            "processing confirmed event"
        );

        if let Some(prev) = self.last_confirmed_event_num
            && prev >= event.confirmed_event_num
        {
            tracing::warn!(
                parent: &self.span,
                prev,
                curr = event.confirmed_event_num,
                "confirmed event older than last one"
            );
        }
        self.last_confirmed_event_num =
            self.last_confirmed_event_num.max(Some(event.confirmed_event_num));

        let Some(payload) = &event.payload else {
            return;
        };

        match payload {
            MlsPayload::InitializeGroup(init) => {
                let snapshot = init.external_group_snapshot.clone();
                let group_info = init.group_info_message.clone();
                self.process_initialize_group(engine, event, &snapshot, group_info).await;
            },
            MlsPayload::ExternalJoin(join) => {
                let commit = join.commit.clone();
                let group_info = join.group_info_message.clone();
                self.process_commit(event, commit, group_info).await;
            },
            MlsPayload::WelcomeMessage(welcome) => {
                let commit = welcome.commit.clone();
                let group_info = welcome.group_info_message.clone();
                self.process_commit(event, commit, group_info).await;
            },
            MlsPayload::EpochSecrets(secrets) => {
                let secrets = secrets.clone();
                self.process_epoch_secrets(event, secrets);
            },
            MlsPayload::KeyPackage(_) => {},
        }
    }

    async fn process_initialize_group(
        &mut self,
        engine: &E,
        event: ConfirmedEvent,
        snapshot: &[u8],
        group_info: Vec<u8>,
    ) {
        if self.remote_group.is_some() {
            tracing::debug!(parent: &self.span, event_id = %event.event_id, "group already initialized");
            self.rejected.insert(event.event_id.clone(), event);
            return;
        }

        match engine.load_external_group(snapshot).await {
            Ok(group) => {
                self.remote_group =
                    Some(RemoteGroup { group, group_info_with_external_key: group_info });
                self.accepted.insert(event.event_id.clone(), event);
            },
            Err(e) => {
                tracing::error!(
                    parent: &self.span,
                    event_id = %event.event_id,
                    error = %e,
                    "initialize group snapshot did not load"
                );
                self.rejected.insert(event.event_id.clone(), event);
            },
        }
    }

    async fn process_commit(&mut self, event: ConfirmedEvent, commit: Vec<u8>, group_info: Vec<u8>) {
        let Some(remote) = self.remote_group.as_mut() else {
            tracing::debug!(parent: &self.span, event_id = %event.event_id, "commit before group exists");
            self.rejected.insert(event.event_id.clone(), event);
            return;
        };

        let epoch = remote.group.epoch();
        match remote.group.process_incoming_message(&commit).await {
            Ok(()) => {
                remote.group_info_with_external_key = group_info;
                self.commits.insert(epoch, commit);
                self.accepted.insert(event.event_id.clone(), event);
            },
            Err(e) => {
                tracing::debug!(
                    parent: &self.span,
                    event_id = %event.event_id,
                    epoch,
                    error = %e,
                    "commit rejected"
                );
                self.rejected.insert(event.event_id.clone(), event);
            },
        }
    }

    fn process_epoch_secrets(&mut self, event: ConfirmedEvent, secrets: EpochSecrets) {
        for secret in secrets.secrets {
            self.sealed_epoch_secrets.insert(secret.epoch, secret.secret);
        }
        self.accepted.insert(event.event_id.clone(), event);
    }

    /// Public state for an external join, if a group exists.
    pub fn external_info(&self) -> Result<Option<RemoteGroupInfo>, EngineError> {
        let Some(remote) = &self.remote_group else {
            return Ok(None);
        };

        Ok(Some(RemoteGroupInfo {
            exported_tree: remote.group.export_tree()?,
            latest_group_info: remote.group_info_with_external_key.clone(),
            epoch: remote.group.epoch(),
        }))
    }

    /// Confirmed epoch, if a group exists.
    pub fn epoch(&self) -> Option<u64> {
        self.remote_group.as_ref().map(|r| r.group.epoch())
    }

    /// Whether a group has been initialized on this stream.
    pub fn has_group(&self) -> bool {
        self.remote_group.is_some()
    }

    /// Number of distinct events that received a verdict.
    pub fn processed_count(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }

    /// Accepted events by id.
    pub fn accepted(&self) -> &BTreeMap<EventId, ConfirmedEvent> {
        &self.accepted
    }

    /// Rejected events by id.
    pub fn rejected(&self) -> &BTreeMap<EventId, ConfirmedEvent> {
        &self.rejected
    }

    /// Commits by pre-commit epoch.
    pub fn commits(&self) -> &BTreeMap<u64, Vec<u8>> {
        &self.commits
    }

    /// Sealed epoch secrets by epoch.
    pub fn sealed_epoch_secrets(&self) -> &BTreeMap<u64, Vec<u8>> {
        &self.sealed_epoch_secrets
    }

    /// Highest confirmed event number seen so far.
    pub fn last_confirmed_event_num(&self) -> Option<u64> {
        self.last_confirmed_event_num
    }

    /// Fold everything confirmed so far into a snapshot for `miniblock_num`.
    pub fn compact(&self, miniblock_num: u64) -> Result<ConfirmedSnapshot, EngineError> {
        let (external_group_snapshot, group_info_message) = match &self.remote_group {
            Some(remote) => (remote.group.snapshot()?, remote.group_info_with_external_key.clone()),
            None => (Vec::new(), Vec::new()),
        };

        Ok(ConfirmedSnapshot {
            confirmed_event_num: self.last_confirmed_event_num.unwrap_or_default(),
            miniblock_num,
            external_group_snapshot,
            group_info_message,
            sealed_epoch_secrets: self.sealed_epoch_secrets.clone(),
        })
    }

    /// Comparable summary of the view.
    pub fn digest(&self) -> Result<RemoteViewDigest, EngineError> {
        Ok(RemoteViewDigest {
            accepted: self.accepted.keys().cloned().collect(),
            rejected: self.rejected.keys().cloned().collect(),
            commits: self.commits.clone(),
            sealed_epoch_secrets: self.sealed_epoch_secrets.clone(),
            external_info: self.external_info()?,
        })
    }
}
