//! The group this client holds for a stream.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  own event accepted   ┌────────┐  commit fails   ┌───────────┐
//! │ Pending │──────────────────────>│ Active │────────────────>│ Corrupted │
//! └─────────┘                       └────────┘                 └───────────┘
//!      │ own event rejected
//!      ↓
//! ┌──────────┐
//! │ Rejected │
//! └──────────┘
//! ```
//!
//! Rejected and Corrupted are terminal for the instance. The processor
//! discards a rejected view and tries again; a corrupted one stays until
//! explicitly cleared.
//!
//! # Epoch secrets
//!
//! Every epoch the group passes through leaves a [`LocalEpochSecret`]. The
//! secret for epoch `e` is announced sealed under the keys of epoch `e + 1`,
//! so anyone who reaches `e + 1` can walk backwards through the history.

use std::collections::BTreeMap;

use cairn_crypto::{CryptoError, DerivedKeys, derive_keys, open, seal};
use cairn_proto::{EpochSecret, EventId};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    error::EngineError,
    mls::{GroupEngine, GroupSession},
    view::RemoteView,
};

/// Lifecycle of a Local View.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocalViewStatus {
    /// Our event is submitted but not yet confirmed
    Pending,
    /// Our event was accepted; following confirmed commits
    Active,
    /// Our event lost the race
    Rejected,
    /// A confirmed commit failed to apply to our group
    Corrupted,
}

impl LocalViewStatus {
    /// Whether the instance can never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Corrupted)
    }
}

/// The submission a pending view is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInfo {
    /// Event whose verdict decides our fate
    pub event_id: EventId,
    /// Latest miniblock when the event was submitted
    pub miniblock_before: u64,
}

/// Secret for one epoch plus the keypair derived from it.
pub struct LocalEpochSecret {
    /// Epoch number
    pub epoch: u64,
    /// Raw epoch secret
    pub secret: Zeroizing<Vec<u8>>,
    /// Keypair from [`derive_keys`]
    pub derived_keys: DerivedKeys,
}

impl LocalEpochSecret {
    /// Derive the keypair for an epoch secret.
    pub fn new(epoch: u64, secret: Vec<u8>) -> Result<Self, CryptoError> {
        let derived_keys = derive_keys(&secret)?;
        Ok(Self { epoch, secret: Zeroizing::new(secret), derived_keys })
    }
}

/// Our group for one stream, reconciled against the Remote View.
pub struct LocalView<G: GroupSession> {
    group: G,
    pending_info: PendingInfo,
    status: LocalViewStatus,
    rejected_epoch: Option<u64>,
    joined_epoch: Option<u64>,
    epoch_secrets: BTreeMap<u64, LocalEpochSecret>,
    span: tracing::Span,
}

impl<G: GroupSession> LocalView<G> {
    /// Wrap a freshly created or joined group waiting on `pending_info`.
    pub fn new(group: G, pending_info: PendingInfo, span: tracing::Span) -> Self {
        Self {
            group,
            pending_info,
            status: LocalViewStatus::Pending,
            rejected_epoch: None,
            joined_epoch: None,
            epoch_secrets: BTreeMap::new(),
            span,
        }
    }

    /// Rebuild a persisted view.
    pub fn restore(
        group: G,
        pending_info: PendingInfo,
        status: LocalViewStatus,
        joined_epoch: Option<u64>,
        epoch_secrets: Vec<LocalEpochSecret>,
        span: tracing::Span,
    ) -> Self {
        Self {
            group,
            pending_info,
            status,
            rejected_epoch: None,
            joined_epoch,
            epoch_secrets: epoch_secrets.into_iter().map(|s| (s.epoch, s)).collect(),
            span,
        }
    }

    /// Advance the state machine against the Remote View.
    pub async fn process_remote_view<E: GroupEngine>(
        &mut self,
        remote: &RemoteView<E>,
    ) -> LocalViewStatus {
        if self.status == LocalViewStatus::Pending {
            let event_id = &self.pending_info.event_id;
            if remote.rejected().contains_key(event_id) {
                tracing::debug!(
                    parent: &self.span,
                    event_id = %event_id,
                    epoch = self.group.epoch(),
                    "own event rejected"
                );
                self.status = LocalViewStatus::Rejected;
                self.rejected_epoch = Some(self.group.epoch());
                return self.status;
            }
            if !remote.accepted().contains_key(event_id) {
                return self.status;
            }

            tracing::debug!(
                parent: &self.span,
                event_id = %event_id,
                epoch = self.group.epoch(),
                "own event accepted"
            );
            self.status = LocalViewStatus::Active;
            self.joined_epoch = Some(self.group.epoch());
            if let Err(e) = self.record_current_epoch_secret() {
                self.mark_corrupted(self.group.epoch(), &e);
                return self.status;
            }
        }

        if self.status != LocalViewStatus::Active {
            return self.status;
        }

        self.apply_commits(remote).await;
        if self.status == LocalViewStatus::Active {
            self.open_sealed_epoch_secrets(remote);
        }
        self.status
    }

    async fn apply_commits<E: GroupEngine>(&mut self, remote: &RemoteView<E>) {
        loop {
            let epoch = self.group.epoch();
            let Some(commit) = remote.commits().get(&epoch) else {
                // The group moved on without a commit we can apply, e.g. the
                // commits were folded into a compaction snapshot
                if let Some(confirmed) = remote.epoch().filter(|confirmed| *confirmed > epoch) {
                    let err = EngineError::InvalidState(format!(
                        "confirmed group is at epoch {confirmed} with no commit for epoch {epoch}"
                    ));
                    self.mark_corrupted(epoch, &err);
                }
                return;
            };

            if let Err(e) = self.group.process_incoming_message(commit).await {
                self.mark_corrupted(epoch, &e);
                return;
            }

            if self.group.epoch() != epoch + 1 {
                let err = EngineError::InvalidState(format!(
                    "commit for epoch {epoch} left group at epoch {}",
                    self.group.epoch()
                ));
                self.mark_corrupted(epoch, &err);
                return;
            }

            tracing::debug!(parent: &self.span, epoch = epoch + 1, "applied confirmed commit");
            if let Err(e) = self.record_current_epoch_secret() {
                self.mark_corrupted(epoch + 1, &e);
                return;
            }
        }
    }

    // Descending so that opening epoch e+1 makes epoch e openable in the same
    // pass.
    fn open_sealed_epoch_secrets<E: GroupEngine>(&mut self, remote: &RemoteView<E>) {
        for (&epoch, sealed) in remote.sealed_epoch_secrets().iter().rev() {
            if self.epoch_secrets.contains_key(&epoch) {
                continue;
            }
            let Some(next) = self.epoch_secrets.get(&(epoch + 1)) else {
                continue;
            };

            match open(&next.derived_keys, sealed).and_then(|secret| LocalEpochSecret::new(epoch, secret)) {
                Ok(secret) => {
                    tracing::debug!(parent: &self.span, epoch, "recovered epoch secret");
                    self.epoch_secrets.insert(epoch, secret);
                },
                Err(e) => {
                    tracing::warn!(parent: &self.span, epoch, error = %e, "sealed epoch secret did not open");
                },
            }
        }
    }

    fn record_current_epoch_secret(&mut self) -> Result<(), EngineError> {
        let epoch = self.group.epoch();
        let secret = self.group.current_epoch_secret()?;
        let secret = LocalEpochSecret::new(epoch, secret)?;
        self.epoch_secrets.insert(epoch, secret);
        Ok(())
    }

    fn mark_corrupted(&mut self, epoch: u64, error: &EngineError) {
        tracing::error!(
            parent: &self.span,
            epoch,
            event_id = %self.pending_info.event_id,
            error = %error,
            "local group diverged from confirmed commits"
        );
        self.status = LocalViewStatus::Corrupted;
        self.rejected_epoch = Some(epoch);
    }

    /// Seal epoch `epoch`'s secret under the keys of `epoch + 1`.
    ///
    /// Returns `None` unless both secrets are held.
    pub fn seal_epoch_secret(&self, epoch: u64) -> Result<Option<EpochSecret>, CryptoError> {
        let (Some(current), Some(next)) =
            (self.epoch_secrets.get(&epoch), self.epoch_secrets.get(&(epoch + 1)))
        else {
            return Ok(None);
        };

        let sealed = seal(&next.derived_keys, &current.secret)?;
        Ok(Some(EpochSecret { epoch, secret: sealed }))
    }

    /// Epochs we hold, announce-able and not yet announced on the log.
    ///
    /// Epochs before the one we joined at were recovered from somebody
    /// else's announcement and are skipped.
    pub fn unannounced_epochs<E: GroupEngine>(&self, remote: &RemoteView<E>) -> Vec<u64> {
        let Some(joined) = self.joined_epoch else {
            return Vec::new();
        };

        self.epoch_secrets
            .keys()
            .copied()
            .filter(|epoch| *epoch >= joined)
            .filter(|epoch| self.epoch_secrets.contains_key(&(epoch + 1)))
            .filter(|epoch| !remote.sealed_epoch_secrets().contains_key(epoch))
            .collect()
    }

    /// Secret for the group's current epoch.
    pub fn latest_epoch_secret(&self) -> Option<&LocalEpochSecret> {
        self.epoch_secrets.get(&self.group.epoch())
    }

    /// Secret for a specific epoch.
    pub fn epoch_secret(&self, epoch: u64) -> Option<&LocalEpochSecret> {
        self.epoch_secrets.get(&epoch)
    }

    /// All held epoch secrets in ascending epoch order.
    pub fn epoch_secrets(&self) -> impl Iterator<Item = &LocalEpochSecret> {
        self.epoch_secrets.values()
    }

    /// Current state.
    pub fn status(&self) -> LocalViewStatus {
        self.status
    }

    /// Epoch whose commit failed, or where our event was rejected.
    pub fn rejected_epoch(&self) -> Option<u64> {
        self.rejected_epoch
    }

    /// Epoch at which we became active.
    pub fn joined_epoch(&self) -> Option<u64> {
        self.joined_epoch
    }

    /// Submission we are waiting on.
    pub fn pending_info(&self) -> &PendingInfo {
        &self.pending_info
    }

    /// Our group.
    pub fn group(&self) -> &G {
        &self.group
    }

    /// Our group, mutably (for staging commits).
    pub fn group_mut(&mut self) -> &mut G {
        &mut self.group
    }
}
