//! Simulated stream log.
//!
//! Submissions collect in a per-stream pool. [`SimLog::confirm_pending`]
//! shuffles the pool with the seeded RNG and confirms it as one miniblock,
//! modelling racing clients whose events reach consensus in arbitrary order.
//! The log never judges MLS content; verdicts are left to replay.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use cairn_core::{EventLog, LogError, StreamHistory, SubmitReceipt};
use cairn_proto::{
    ConfirmedEvent, ConfirmedSnapshot, ContentKind, EncryptedContentItem, EncryptedData, EventId,
    MlsPayload, StreamId,
};
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

use crate::sim_env::{EnvRng, SimEnv};

#[derive(Default)]
struct StreamLog {
    pending: Vec<(EventId, MlsPayload)>,
    confirmed: Vec<ConfirmedEvent>,
    content: Vec<EncryptedContentItem>,
    miniblock_num: u64,
    snapshot: Option<ConfirmedSnapshot>,
}

#[derive(Default)]
struct LogInner {
    streams: HashMap<StreamId, StreamLog>,
    submissions: u64,
    unavailable: bool,
}

/// Shared in-memory log; clones see the same streams.
#[derive(Clone)]
pub struct SimLog {
    inner: Arc<Mutex<LogInner>>,
    env: SimEnv,
}

impl SimLog {
    /// Create an empty log shuffling with `env`'s RNG.
    pub fn new(env: SimEnv) -> Self {
        Self { inner: Arc::new(Mutex::new(LogInner::default())), env }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a stream. Creating an existing stream is a no-op.
    pub fn create_stream(&self, stream_id: &StreamId) {
        self.lock().streams.entry(stream_id.clone()).or_default();
    }

    /// Make every submission fail with [`LogError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn next_event_id(inner: &mut LogInner, stream_id: &StreamId) -> EventId {
        inner.submissions += 1;
        let mut hasher = Sha256::new();
        hasher.update(stream_id.as_str().as_bytes());
        hasher.update(inner.submissions.to_be_bytes());
        EventId::from_hash(&hasher.finalize())
    }

    /// Confirm every pending submission on a stream, in shuffled order, as
    /// one miniblock.
    pub fn confirm_pending(&self, stream_id: &StreamId) -> Vec<ConfirmedEvent> {
        let mut inner = self.lock();
        let Some(stream) = inner.streams.get_mut(stream_id) else {
            return Vec::new();
        };
        if stream.pending.is_empty() {
            return Vec::new();
        }

        let mut batch = std::mem::take(&mut stream.pending);
        batch.shuffle(&mut EnvRng(self.env.clone()));

        stream.miniblock_num += 1;
        let mut confirmed = Vec::with_capacity(batch.len());
        for (event_id, payload) in batch {
            let event = ConfirmedEvent {
                event_id,
                confirmed_event_num: stream.confirmed.len() as u64,
                miniblock_num: stream.miniblock_num,
                payload: Some(payload),
            };
            stream.confirmed.push(event.clone());
            confirmed.push(event);
        }
        confirmed
    }

    /// Confirm pending submissions on every stream.
    pub fn confirm_all(&self) -> usize {
        let mut ids: Vec<StreamId> = self.lock().streams.keys().cloned().collect();
        ids.sort();
        ids.iter().map(|id| self.confirm_pending(id).len()).sum()
    }

    /// Confirmed events from position `from` on.
    pub fn events_since(&self, stream_id: &StreamId, from: usize) -> Vec<ConfirmedEvent> {
        self.lock()
            .streams
            .get(stream_id)
            .map(|s| s.confirmed.iter().skip(from).cloned().collect())
            .unwrap_or_default()
    }

    /// Encrypted content from position `from` on.
    pub fn content_since(&self, stream_id: &StreamId, from: usize) -> Vec<EncryptedContentItem> {
        self.lock()
            .streams
            .get(stream_id)
            .map(|s| s.content.iter().skip(from).cloned().collect())
            .unwrap_or_default()
    }

    /// Post an encrypted message; content is confirmed immediately.
    pub fn post_content(
        &self,
        stream_id: &StreamId,
        envelope: &EncryptedData,
    ) -> Result<EventId, LogError> {
        let mut inner = self.lock();
        if !inner.streams.contains_key(stream_id) {
            return Err(LogError::StreamNotFound(stream_id.clone()));
        }

        let event_id = Self::next_event_id(&mut inner, stream_id);
        let item = EncryptedContentItem {
            stream_id: stream_id.clone(),
            event_id: event_id.clone(),
            kind: ContentKind::Message,
            epoch: envelope.epoch(),
            ciphertext: envelope.mls.ciphertext.clone(),
        };
        if let Some(stream) = inner.streams.get_mut(stream_id) {
            stream.content.push(item);
        }
        Ok(event_id)
    }

    /// Replace the stream's compaction snapshot.
    pub fn store_snapshot(&self, stream_id: &StreamId, snapshot: ConfirmedSnapshot) {
        if let Some(stream) = self.lock().streams.get_mut(stream_id) {
            stream.snapshot = Some(snapshot);
        }
    }

    /// Latest miniblock number of a stream.
    pub fn miniblock_num(&self, stream_id: &StreamId) -> u64 {
        self.lock().streams.get(stream_id).map_or(0, |s| s.miniblock_num)
    }

    /// Number of confirmed events on a stream.
    pub fn confirmed_count(&self, stream_id: &StreamId) -> usize {
        self.lock().streams.get(stream_id).map_or(0, |s| s.confirmed.len())
    }

    /// Submissions not yet confirmed, per stream.
    pub fn pending_counts(&self) -> BTreeMap<StreamId, usize> {
        self.lock().streams.iter().map(|(id, s)| (id.clone(), s.pending.len())).collect()
    }
}

#[async_trait]
impl EventLog for SimLog {
    async fn submit(
        &self,
        stream_id: &StreamId,
        payload: MlsPayload,
    ) -> Result<SubmitReceipt, LogError> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(LogError::Unavailable("simulated outage".into()));
        }
        if !inner.streams.contains_key(stream_id) {
            return Err(LogError::StreamNotFound(stream_id.clone()));
        }

        let event_id = Self::next_event_id(&mut inner, stream_id);
        let stream = inner.streams.entry(stream_id.clone()).or_default();
        stream.pending.push((event_id.clone(), payload));
        Ok(SubmitReceipt { event_id, miniblock_num: stream.miniblock_num })
    }

    async fn history(&self, stream_id: &StreamId) -> Result<StreamHistory, LogError> {
        let inner = self.lock();
        let stream =
            inner.streams.get(stream_id).ok_or_else(|| LogError::StreamNotFound(stream_id.clone()))?;
        Ok(StreamHistory { snapshot: stream.snapshot.clone(), events: stream.confirmed.clone() })
    }
}

#[cfg(test)]
mod tests {
    use cairn_proto::{EpochSecrets, KeyPackage};

    use super::*;

    fn payload(n: u8) -> MlsPayload {
        MlsPayload::KeyPackage(KeyPackage { signature_public_key: vec![n], key_package: vec![n] })
    }

    #[tokio::test]
    async fn submissions_confirm_as_one_miniblock() {
        let log = SimLog::new(SimEnv::with_seed(3));
        let stream = StreamId::new("s");
        log.create_stream(&stream);

        let mut submitted = Vec::new();
        for n in 0..5 {
            submitted.push(log.submit(&stream, payload(n)).await.unwrap().event_id);
        }

        let confirmed = log.confirm_pending(&stream);
        assert_eq!(confirmed.len(), 5);
        assert!(confirmed.iter().all(|e| e.miniblock_num == 1));
        let nums: Vec<u64> = confirmed.iter().map(|e| e.confirmed_event_num).collect();
        assert_eq!(nums, vec![0, 1, 2, 3, 4]);

        let mut ids: Vec<EventId> = confirmed.into_iter().map(|e| e.event_id).collect();
        ids.sort();
        submitted.sort();
        assert_eq!(ids, submitted);
    }

    #[tokio::test]
    async fn same_seed_same_order() {
        let order = |seed| async move {
            let log = SimLog::new(SimEnv::with_seed(seed));
            let stream = StreamId::new("s");
            log.create_stream(&stream);
            for n in 0..8 {
                log.submit(&stream, payload(n)).await.unwrap();
            }
            log.confirm_pending(&stream).into_iter().map(|e| e.event_id).collect::<Vec<_>>()
        };

        assert_eq!(order(11).await, order(11).await);
    }

    #[tokio::test]
    async fn unknown_stream_and_outage_fail_submission() {
        let log = SimLog::new(SimEnv::new());
        let stream = StreamId::new("s");

        let err = log.submit(&stream, payload(0)).await.unwrap_err();
        assert!(matches!(err, LogError::StreamNotFound(_)));

        log.create_stream(&stream);
        log.set_unavailable(true);
        let err = log
            .submit(&stream, MlsPayload::EpochSecrets(EpochSecrets::default()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn history_returns_snapshot_and_events() {
        let log = SimLog::new(SimEnv::new());
        let stream = StreamId::new("s");
        log.create_stream(&stream);
        log.submit(&stream, payload(1)).await.unwrap();
        log.confirm_pending(&stream);
        log.store_snapshot(&stream, ConfirmedSnapshot { confirmed_event_num: 0, ..Default::default() });

        let history = log.history(&stream).await.unwrap();
        assert_eq!(history.events.len(), 1);
        assert_eq!(history.snapshot.map(|s| s.confirmed_event_num), Some(0));
    }
}
