//! Per-stream MLS state owned by the processor.

use std::collections::{BTreeMap, BTreeSet};

use cairn_crypto::open;
use cairn_proto::{EncryptedContentItem, EventId, StreamId};
use tokio::sync::watch;

use crate::{
    error::{DecryptionError, DecryptionFailureReason},
    mls::GroupEngine,
    view::{LocalView, LocalViewStatus, RemoteView},
};

/// Remote View, optional Local View and decryption bookkeeping for one
/// stream.
pub struct MlsStream<E: GroupEngine> {
    pub(crate) stream_id: StreamId,
    pub(crate) remote: RemoteView<E>,
    pub(crate) local: Option<LocalView<E::Group>>,
    pub(crate) span: tracing::Span,

    status_tx: watch::Sender<Option<LocalViewStatus>>,

    /// Content not yet attempted
    pub(crate) pending_content: Vec<EncryptedContentItem>,
    /// Content waiting for an epoch secret, by epoch
    awaiting_secret: BTreeMap<u64, Vec<EncryptedContentItem>>,
    decrypted: BTreeMap<EventId, Vec<u8>>,
    undecryptable: BTreeMap<EventId, DecryptionError>,

    /// Welcome events already tried against our key packages
    pub(crate) tried_welcomes: BTreeSet<EventId>,
    /// Epochs submitted in an EpochSecrets event but not yet confirmed
    pub(crate) announcing: BTreeSet<u64>,
    /// Highest epoch whose secret has been written to storage
    pub(crate) persisted_through: Option<u64>,
    /// Group id and pending event of the view currently in storage
    pub(crate) persisted_view: Option<(Vec<u8>, EventId)>,
}

impl<E: GroupEngine> MlsStream<E> {
    /// Empty state for a stream.
    pub fn new(stream_id: StreamId, span: tracing::Span) -> Self {
        let (status_tx, _) = watch::channel(None);
        Self {
            remote: RemoteView::new(span.clone()),
            stream_id,
            local: None,
            span,
            status_tx,
            pending_content: Vec::new(),
            awaiting_secret: BTreeMap::new(),
            decrypted: BTreeMap::new(),
            undecryptable: BTreeMap::new(),
            tried_welcomes: BTreeSet::new(),
            announcing: BTreeSet::new(),
            persisted_through: None,
            persisted_view: None,
        }
    }

    /// Local View status, `None` when no view is attached.
    pub fn status(&self) -> Option<LocalViewStatus> {
        self.local.as_ref().map(LocalView::status)
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<LocalViewStatus>> {
        self.status_tx.subscribe()
    }

    /// Publish the current status to watchers if it changed.
    pub(crate) fn notify_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Remote View.
    pub fn remote(&self) -> &RemoteView<E> {
        &self.remote
    }

    /// Local View, if attached.
    pub fn local(&self) -> Option<&LocalView<E::Group>> {
        self.local.as_ref()
    }

    /// Plaintext of a decrypted event.
    pub fn decrypted(&self, event_id: &EventId) -> Option<&[u8]> {
        self.decrypted.get(event_id).map(Vec::as_slice)
    }

    /// Permanent decryption failure for an event.
    pub fn undecryptable(&self, event_id: &EventId) -> Option<&DecryptionError> {
        self.undecryptable.get(event_id)
    }

    /// Number of items waiting for an epoch secret.
    pub fn awaiting_secret_count(&self) -> usize {
        self.awaiting_secret.values().map(Vec::len).sum()
    }

    /// Open a ciphertext sealed under `epoch`.
    pub(crate) fn open_content(
        &self,
        event_id: &EventId,
        epoch: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecryptionError> {
        let failure = |reason| DecryptionError {
            stream_id: self.stream_id.clone(),
            event_id: event_id.clone(),
            epoch,
            reason,
        };

        let local = self.local.as_ref().ok_or_else(|| failure(DecryptionFailureReason::NoGroup))?;
        let secret = local
            .epoch_secret(epoch)
            .ok_or_else(|| failure(DecryptionFailureReason::MissingEpochSecret))?;

        open(&secret.derived_keys, ciphertext).map_err(|e| failure(DecryptionFailureReason::Crypto(e)))
    }

    /// Decrypt newly queued content and retry content whose epoch secret has
    /// since become available.
    pub(crate) fn process_content(&mut self) {
        let mut items = std::mem::take(&mut self.pending_content);

        let ready: Vec<u64> = self
            .awaiting_secret
            .keys()
            .copied()
            .filter(|epoch| self.local.as_ref().is_some_and(|l| l.epoch_secret(*epoch).is_some()))
            .collect();
        for epoch in ready {
            items.extend(self.awaiting_secret.remove(&epoch).unwrap_or_default());
        }

        for item in items {
            if self.decrypted.contains_key(&item.event_id) {
                continue;
            }

            match self.open_content(&item.event_id, item.epoch, &item.ciphertext) {
                Ok(plaintext) => {
                    tracing::trace!(parent: &self.span, event_id = %item.event_id, epoch = item.epoch, "decrypted content");
                    self.decrypted.insert(item.event_id, plaintext);
                },
                Err(e) if e.is_retryable() => {
                    tracing::debug!(parent: &self.span, event_id = %item.event_id, epoch = item.epoch, reason = %e.reason, "content waiting for epoch secret");
                    self.awaiting_secret.entry(item.epoch).or_default().push(item);
                },
                Err(e) => {
                    tracing::warn!(parent: &self.span, event_id = %item.event_id, error = %e, "content failed to decrypt");
                    self.undecryptable.insert(item.event_id, e);
                },
            }
        }
    }
}
