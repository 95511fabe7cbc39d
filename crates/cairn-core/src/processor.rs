//! Per-client MLS processor.
//!
//! Owns one [`MlsStream`] per tracked stream and drives it from stream
//! updates:
//!
//! 1. Confirmed snapshots and events go into the Remote View.
//! 2. The Local View is reconciled against it (verdict, commits, backlog).
//! 3. If we hold no usable group, try accepted welcomes addressed to us.
//! 4. Optionally join (external commit) or create the group.
//! 5. Optionally announce epoch secrets the log is missing.
//! 6. Decrypt queued content, retrying items that were waiting on a secret.
//! 7. Persist group state, new epoch secrets and the Local View.
//!
//! Each stream sits behind its own async mutex, so updates for one stream
//! apply strictly in order while different streams proceed independently.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use cairn_crypto::seal;
use cairn_proto::{
    ConfirmedSnapshot, EncryptedData, EpochSecrets, EventId, ExternalJoin, InitializeGroup,
    KeyPackage, MlsPayload, StreamId, WelcomeMessage,
};
use tokio::sync::{Mutex, watch};

use crate::{
    config::ProcessorConfig,
    error::{DecryptionError, DecryptionFailureReason, EngineError, ProcessorError},
    log::{EventLog, SubmitReceipt},
    mls::{GroupEngine, GroupSession},
    queue::{StreamUpdate, StreamUpdateDelegate},
    storage::{EpochRecord, LocalViewSnapshot, ProcessorStore},
    stream::MlsStream,
    view::{LocalEpochSecret, LocalView, LocalViewStatus, PendingInfo, RemoteView, RemoteViewDigest},
};

type StreamHandle<E> = Arc<Mutex<MlsStream<E>>>;

/// Reconciles every tracked stream of one client.
pub struct Processor<E: GroupEngine, L: EventLog, S: ProcessorStore> {
    engine: E,
    log: L,
    store: S,
    config: ProcessorConfig,
    streams: StdMutex<HashMap<StreamId, StreamHandle<E>>>,
    span: tracing::Span,
}

impl<E: GroupEngine, L: EventLog, S: ProcessorStore> Processor<E, L, S> {
    /// Create a processor with no tracked streams.
    pub fn new(engine: E, log: L, store: S, config: ProcessorConfig, span: tracing::Span) -> Self {
        Self { engine, log, store, config, streams: StdMutex::new(HashMap::new()), span }
    }

    /// Group engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Event log.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Storage.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Configuration.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Streams seen so far.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<StreamId> = streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn stream_handle(&self, stream_id: &StreamId) -> StreamHandle<E> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = streams.entry(stream_id.clone()).or_insert_with(|| {
            let span = tracing::debug_span!(parent: &self.span, "stream", stream_id = %stream_id);
            Arc::new(Mutex::new(MlsStream::new(stream_id.clone(), span)))
        });
        Arc::clone(handle)
    }

    /// Rebuild a stream from the log and from storage.
    ///
    /// The Remote View is replayed from the log's history. A persisted Local
    /// View is restored with its group state and retained epoch secrets,
    /// then reconciled against the fresh Remote View.
    pub async fn track_stream(&self, stream_id: &StreamId) -> Result<(), ProcessorError> {
        let history = self.log.history(stream_id).await?;
        let handle = self.stream_handle(stream_id);
        let mut stream = handle.lock().await;

        stream.remote = RemoteView::load_from_log(&self.engine, &history, stream.span.clone()).await;
        let (local, persisted_through) = self.restore_local_view(stream_id, &stream.span).await?;
        stream.persisted_view =
            local.as_ref().map(|l| (l.group().group_id(), l.pending_info().event_id.clone()));
        stream.local = local;
        stream.persisted_through = persisted_through;

        tracing::info!(
            parent: &stream.span,
            events = history.events.len(),
            remote_epoch = ?stream.remote.epoch(),
            restored = stream.local.is_some(),
            "tracking stream"
        );

        self.reconcile(&mut stream).await;
        stream.process_content();
        self.persist(&mut stream).await
    }

    async fn restore_local_view(
        &self,
        stream_id: &StreamId,
        span: &tracing::Span,
    ) -> Result<(Option<LocalView<E::Group>>, Option<u64>), ProcessorError> {
        let Some(snapshot) = self.store.load_local_view(stream_id).await? else {
            return Ok((None, None));
        };
        if snapshot.status == LocalViewStatus::Rejected {
            self.store.delete_group(&snapshot.group_id).await?;
            self.store.clear_local_view(stream_id).await?;
            return Ok((None, None));
        }

        let Some(state) = self.store.state(&snapshot.group_id).await? else {
            tracing::warn!(parent: span, "local view saved without group state, discarding");
            self.store.delete_group(&snapshot.group_id).await?;
            self.store.clear_local_view(stream_id).await?;
            return Ok((None, None));
        };
        let group = self.engine.load_group(&state).await?;

        let max_epoch = self.store.max_epoch_id(&snapshot.group_id).await?;
        let mut secrets = Vec::new();
        if let Some(max) = max_epoch {
            for epoch in (0..=max).rev() {
                let Some(data) = self.store.epoch(&snapshot.group_id, epoch).await? else {
                    break;
                };
                secrets.push(LocalEpochSecret::new(epoch, data)?);
            }
        }

        tracing::debug!(
            parent: span,
            status = ?snapshot.status,
            epoch = group.epoch(),
            secrets = secrets.len(),
            "restored local view"
        );

        let view = LocalView::restore(
            group,
            snapshot.pending_info,
            snapshot.status,
            snapshot.joined_epoch,
            secrets,
            span.clone(),
        );
        Ok((Some(view), max_epoch))
    }

    /// Apply one batch of log updates to a stream.
    pub async fn process_stream_update(&self, update: StreamUpdate) -> Result<(), ProcessorError> {
        let handle = self.stream_handle(&update.stream_id);
        let mut stream = handle.lock().await;

        tracing::trace!(
            parent: &stream.span,
            snapshots = update.snapshots.len(),
            events = update.confirmed_events.len(),
            content = update.encrypted_content.len(),
            "processing stream update"
        );

        for snapshot in &update.snapshots {
            stream.remote.process_snapshot(&self.engine, snapshot).await;
        }
        for event in update.confirmed_events {
            stream.remote.process_confirmed_event(&self.engine, event).await;
        }

        self.reconcile(&mut stream).await;

        let joined =
            if self.config.auto_join { self.initialize_or_join(&mut stream).await } else { Ok(()) };
        if let Err(e) = joined {
            tracing::warn!(parent: &stream.span, error = %e, "automatic join failed");
        }
        if self.config.announce_epoch_secrets {
            self.announce_epoch_secrets(&mut stream).await?;
        }

        stream.pending_content.extend(update.encrypted_content);
        stream.process_content();

        self.persist(&mut stream).await
    }

    async fn reconcile(&self, stream: &mut MlsStream<E>) {
        if let Some(local) = stream.local.as_mut() {
            local.process_remote_view(&stream.remote).await;
        }
        self.join_from_welcome(stream).await;

        let confirmed = stream.remote.sealed_epoch_secrets();
        stream.announcing.retain(|epoch| !confirmed.contains_key(epoch));

        stream.notify_status();
    }

    /// Join from an accepted welcome when we hold no usable group.
    async fn join_from_welcome(&self, stream: &mut MlsStream<E>) {
        if stream.local.as_ref().is_some_and(|l| l.status() != LocalViewStatus::Rejected) {
            return;
        }

        let mut candidates: Vec<(u64, EventId, u64, Vec<Vec<u8>>)> = stream
            .remote
            .accepted()
            .values()
            .filter(|event| !stream.tried_welcomes.contains(&event.event_id))
            .filter_map(|event| match &event.payload {
                Some(MlsPayload::WelcomeMessage(welcome)) => Some((
                    event.confirmed_event_num,
                    event.event_id.clone(),
                    event.miniblock_num,
                    welcome.welcome_messages.clone(),
                )),
                _ => None,
            })
            .collect();
        // Newest first
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, event_id, miniblock_num, welcomes) in candidates {
            stream.tried_welcomes.insert(event_id.clone());

            for welcome in welcomes {
                match self.engine.join_group(&welcome).await {
                    Ok(group) => {
                        tracing::info!(
                            parent: &stream.span,
                            event_id = %event_id,
                            epoch = group.epoch(),
                            "joined from welcome"
                        );
                        let pending = PendingInfo { event_id, miniblock_before: miniblock_num };
                        let mut local = LocalView::new(group, pending, stream.span.clone());
                        local.process_remote_view(&stream.remote).await;
                        stream.local = Some(local);
                        stream.persisted_through = None;
                        return;
                    },
                    Err(EngineError::NoMatchingKeyPackage) => {},
                    Err(e) => {
                        tracing::warn!(parent: &stream.span, event_id = %event_id, error = %e, "welcome did not join");
                    },
                }
            }
        }
    }

    /// Create the stream's group or join it with an external commit.
    ///
    /// No-op while a view is pending or active. A corrupted view is left for
    /// [`Self::clear_corrupted`]; a rejected one is discarded and the attempt
    /// repeated against the current Remote View.
    pub async fn initialize_or_join_group(&self, stream_id: &StreamId) -> Result<(), ProcessorError> {
        let handle = self.stream_handle(stream_id);
        let mut stream = handle.lock().await;
        self.initialize_or_join(&mut stream).await?;
        self.persist(&mut stream).await
    }

    async fn initialize_or_join(&self, stream: &mut MlsStream<E>) -> Result<(), ProcessorError> {
        match stream.status() {
            Some(LocalViewStatus::Pending | LocalViewStatus::Active) => return Ok(()),
            Some(LocalViewStatus::Corrupted) => {
                tracing::warn!(parent: &stream.span, "local view corrupted, not joining");
                return Ok(());
            },
            Some(LocalViewStatus::Rejected) => {
                tracing::debug!(parent: &stream.span, "discarding rejected local view");
                stream.local = None;
                stream.persisted_through = None;
            },
            None => {},
        }

        let (group, payload) = match stream.remote.external_info()? {
            Some(info) => {
                let joined =
                    self.engine.commit_external(&info.latest_group_info, &info.exported_tree).await?;
                let payload = MlsPayload::ExternalJoin(ExternalJoin {
                    signature_public_key: self.engine.signature_public_key(),
                    group_info_message: joined.group.group_info_message(true)?,
                    commit: joined.commit,
                    epoch: info.epoch,
                });
                (joined.group, payload)
            },
            None => {
                let group = self.engine.create_group().await?;
                let payload = MlsPayload::InitializeGroup(InitializeGroup {
                    signature_public_key: self.engine.signature_public_key(),
                    external_group_snapshot: group.external_group_snapshot()?,
                    group_info_message: group.group_info_message(true)?,
                });
                (group, payload)
            },
        };

        let kind = payload.kind();
        let receipt = self.log.submit(&stream.stream_id, payload).await?;
        tracing::debug!(
            parent: &stream.span,
            kind,
            event_id = %receipt.event_id,
            epoch = group.epoch(),
            "submitted group event"
        );

        let pending =
            PendingInfo { event_id: receipt.event_id, miniblock_before: receipt.miniblock_num };
        stream.local = Some(LocalView::new(group, pending, stream.span.clone()));
        stream.notify_status();
        Ok(())
    }

    /// Submit sealed secrets for epochs the log has no announcement for.
    ///
    /// Submission failures are logged and retried on the next update.
    async fn announce_epoch_secrets(&self, stream: &mut MlsStream<E>) -> Result<(), ProcessorError> {
        let Some(local) =
            stream.local.as_ref().filter(|l| l.status() == LocalViewStatus::Active)
        else {
            return Ok(());
        };

        let mut secrets = Vec::new();
        for epoch in local.unannounced_epochs(&stream.remote) {
            if stream.announcing.contains(&epoch) {
                continue;
            }
            if let Some(sealed) = local.seal_epoch_secret(epoch)? {
                secrets.push(sealed);
            }
        }
        if secrets.is_empty() {
            return Ok(());
        }

        let epochs: Vec<u64> = secrets.iter().map(|s| s.epoch).collect();
        let payload = MlsPayload::EpochSecrets(EpochSecrets { secrets });
        match self.log.submit(&stream.stream_id, payload).await {
            Ok(receipt) => {
                tracing::debug!(parent: &stream.span, ?epochs, event_id = %receipt.event_id, "announced epoch secrets");
                stream.announcing.extend(epochs);
            },
            Err(e) => {
                tracing::warn!(parent: &stream.span, ?epochs, error = %e, "failed to announce epoch secrets");
            },
        }
        Ok(())
    }

    async fn persist(&self, stream: &mut MlsStream<E>) -> Result<(), ProcessorError> {
        let local = stream.local.as_ref().filter(|l| l.status() != LocalViewStatus::Rejected);
        let current = local.map(|l| (l.group().group_id(), l.pending_info().event_id.clone()));

        // A rejected, cleared or replaced view leaves its group state behind.
        // A rejoin may reuse the group id, so views are told apart by their
        // pending event as well.
        if let Some((stale, _)) = stream.persisted_view.take_if(|stored| current.as_ref() != Some(&*stored))
        {
            tracing::debug!(parent: &stream.span, group_id = %hex::encode(&stale), "deleting discarded group state");
            self.store.delete_group(&stale).await?;
            stream.persisted_through = None;
        }

        let (Some(local), Some((group_id, event_id))) = (local, current) else {
            self.store.clear_local_view(&stream.stream_id).await?;
            return Ok(());
        };

        let state = local.group().export_state()?;

        // Only epochs past the last persisted one; secrets recovered from the
        // backlog stay in memory.
        let inserts: Vec<EpochRecord> = local
            .epoch_secrets()
            .filter(|s| stream.persisted_through.is_none_or(|through| s.epoch > through))
            .map(|s| EpochRecord { id: s.epoch, data: s.secret.to_vec() })
            .collect();

        self.store.write(&group_id, &state, &inserts, &[]).await?;
        stream.persisted_view = Some((group_id.clone(), event_id));

        let snapshot = LocalViewSnapshot {
            stream_id: stream.stream_id.clone(),
            group_id,
            pending_info: local.pending_info().clone(),
            status: local.status(),
            joined_epoch: local.joined_epoch(),
        };
        self.store.save_local_view(&snapshot).await?;

        if let Some(max) = inserts.iter().map(|r| r.id).max() {
            stream.persisted_through = Some(max);
        }
        Ok(())
    }

    /// Encrypt a message under the latest epoch secret.
    ///
    /// Waits for the Local View to become active, up to `timeout`. `None`
    /// falls back to [`ProcessorConfig::encrypt_timeout`]; an unbounded wait
    /// needs a processor configured without one.
    pub async fn encrypt_message(
        &self,
        stream_id: &StreamId,
        plaintext: &[u8],
        timeout: Option<Duration>,
    ) -> Result<EncryptedData, ProcessorError> {
        let handle = self.stream_handle(stream_id);
        let mut status_rx = handle.lock().await.subscribe();

        let settled = async {
            status_rx
                .wait_for(|s| {
                    matches!(s, Some(LocalViewStatus::Active | LocalViewStatus::Corrupted))
                })
                .await
                .map(|s| *s)
        };

        let status = match timeout.or(self.config.encrypt_timeout) {
            Some(limit) => tokio::time::timeout(limit, settled).await.map_err(|_| {
                ProcessorError::Timeout { stream_id: stream_id.clone(), elapsed: limit }
            })?,
            None => settled.await,
        };

        if status.is_err() {
            return Err(ProcessorError::NotActive { stream_id: stream_id.clone() });
        }

        // Status may have moved again since the wake-up
        let stream = handle.lock().await;
        let local = match stream.local() {
            Some(local) if local.status() == LocalViewStatus::Active => local,
            Some(local) if local.status() == LocalViewStatus::Corrupted => {
                return Err(ProcessorError::Corrupted {
                    stream_id: stream_id.clone(),
                    epoch: local.rejected_epoch(),
                });
            },
            _ => return Err(ProcessorError::NotActive { stream_id: stream_id.clone() }),
        };
        let secret = local
            .latest_epoch_secret()
            .ok_or_else(|| ProcessorError::NoEpochSecret { stream_id: stream_id.clone() })?;

        let ciphertext = seal(&secret.derived_keys, plaintext)?;
        tracing::trace!(parent: &stream.span, epoch = secret.epoch, len = plaintext.len(), "encrypted message");
        Ok(EncryptedData::mls(secret.epoch, ciphertext))
    }

    /// Decrypt an envelope with the secret for its epoch.
    pub async fn decrypt_message(
        &self,
        stream_id: &StreamId,
        event_id: &EventId,
        envelope: &EncryptedData,
    ) -> Result<Vec<u8>, DecryptionError> {
        let handle = self.stream_handle(stream_id);
        let stream = handle.lock().await;

        envelope.validate().map_err(|e| DecryptionError {
            stream_id: stream_id.clone(),
            event_id: event_id.clone(),
            epoch: envelope.epoch(),
            reason: DecryptionFailureReason::Envelope(e),
        })?;
        stream.open_content(event_id, envelope.epoch(), &envelope.mls.ciphertext)
    }

    /// Drop a corrupted Local View so the stream can be joined again.
    ///
    /// Returns whether a view was cleared.
    pub async fn clear_corrupted(&self, stream_id: &StreamId) -> Result<bool, ProcessorError> {
        let handle = self.stream_handle(stream_id);
        let mut stream = handle.lock().await;
        if stream.status() != Some(LocalViewStatus::Corrupted) {
            return Ok(false);
        }

        tracing::info!(parent: &stream.span, "clearing corrupted local view");
        stream.local = None;
        stream.persisted_through = None;
        stream.announcing.clear();
        self.persist(&mut stream).await?;
        stream.notify_status();
        Ok(true)
    }

    /// Publish a key package so a member can add us.
    pub async fn publish_key_package(&self, stream_id: &StreamId) -> Result<SubmitReceipt, ProcessorError> {
        let key_package = self.engine.generate_key_package().await?;
        let payload = MlsPayload::KeyPackage(KeyPackage {
            signature_public_key: self.engine.signature_public_key(),
            key_package,
        });
        Ok(self.log.submit(stream_id, payload).await?)
    }

    /// Add a member by key package and submit the commit with its welcome.
    ///
    /// The commit only takes effect once the log accepts the event.
    pub async fn add_member(
        &self,
        stream_id: &StreamId,
        key_package: &[u8],
    ) -> Result<SubmitReceipt, ProcessorError> {
        let handle = self.stream_handle(stream_id);
        let mut stream = handle.lock().await;

        let local = match stream.local.as_mut() {
            Some(local) if local.status() == LocalViewStatus::Active => local,
            _ => return Err(ProcessorError::NotActive { stream_id: stream_id.clone() }),
        };
        let added = local.group_mut().add_member(key_package).await?;

        let payload = MlsPayload::WelcomeMessage(WelcomeMessage {
            signature_public_key: self.engine.signature_public_key(),
            commit: added.commit,
            group_info_message: added.group_info,
            welcome_messages: vec![added.welcome],
        });
        let receipt = self.log.submit(stream_id, payload).await?;
        tracing::debug!(parent: &stream.span, event_id = %receipt.event_id, "submitted add commit");

        self.persist(&mut stream).await?;
        Ok(receipt)
    }

    /// Local View status.
    pub async fn status(&self, stream_id: &StreamId) -> Option<LocalViewStatus> {
        self.stream_handle(stream_id).lock().await.status()
    }

    /// Watch Local View status changes.
    pub async fn subscribe(&self, stream_id: &StreamId) -> watch::Receiver<Option<LocalViewStatus>> {
        self.stream_handle(stream_id).lock().await.subscribe()
    }

    /// Current epoch of our group.
    pub async fn epoch(&self, stream_id: &StreamId) -> Option<u64> {
        self.stream_handle(stream_id).lock().await.local().map(|l| l.group().epoch())
    }

    /// Epochs we hold secrets for, ascending.
    pub async fn epoch_secret_ids(&self, stream_id: &StreamId) -> Vec<u64> {
        let handle = self.stream_handle(stream_id);
        let stream = handle.lock().await;
        stream.local().map(|l| l.epoch_secrets().map(|s| s.epoch).collect()).unwrap_or_default()
    }

    /// Comparable summary of the Remote View.
    pub async fn remote_digest(&self, stream_id: &StreamId) -> Result<RemoteViewDigest, ProcessorError> {
        Ok(self.stream_handle(stream_id).lock().await.remote().digest()?)
    }

    /// Compaction snapshot of the stream's Remote View.
    pub async fn compact(
        &self,
        stream_id: &StreamId,
        miniblock_num: u64,
    ) -> Result<ConfirmedSnapshot, ProcessorError> {
        Ok(self.stream_handle(stream_id).lock().await.remote().compact(miniblock_num)?)
    }

    /// Plaintext of a content event decrypted from stream updates.
    pub async fn decrypted(&self, stream_id: &StreamId, event_id: &EventId) -> Option<Vec<u8>> {
        self.stream_handle(stream_id).lock().await.decrypted(event_id).map(<[u8]>::to_vec)
    }

    /// Content items still waiting for an epoch secret.
    pub async fn awaiting_secret_count(&self, stream_id: &StreamId) -> usize {
        self.stream_handle(stream_id).lock().await.awaiting_secret_count()
    }
}

#[async_trait]
impl<E, L, S> StreamUpdateDelegate for Processor<E, L, S>
where
    E: GroupEngine,
    L: EventLog,
    S: ProcessorStore,
{
    async fn handle_stream_update(&self, update: StreamUpdate) -> Result<(), ProcessorError> {
        self.process_stream_update(update).await
    }
}
