use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use cairn_proto::StreamId;

use super::{
    EpochRecord, GroupStateStorage, LocalViewSnapshot, LocalViewStore, retention_floor,
};
use crate::{config::StorageConfig, error::StorageError};

/// In-memory storage implementation for testing and simulation
///
/// All state is wrapped in `Arc<Mutex<>>` so clones share one store, which
/// lets a test hand the same storage to a restarted processor.
///
/// # Thread Safety
///
/// The lock is never held across an await. A poisoned lock is recovered
/// rather than propagated since every write leaves the maps consistent.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
    retention: u64,
}

#[derive(Default)]
struct MemoryStorageInner {
    /// Serialized group state by group id
    states: HashMap<Vec<u8>, Vec<u8>>,

    /// Epoch records by group id, ordered by epoch
    epochs: HashMap<Vec<u8>, BTreeMap<u64, Vec<u8>>>,

    /// Local View snapshots by stream
    local_views: HashMap<StreamId, LocalViewSnapshot>,
}

impl MemoryStorage {
    /// Create an empty store with default retention.
    pub fn new() -> Self {
        Self::with_config(&StorageConfig::default())
    }

    /// Create an empty store.
    pub fn with_config(config: &StorageConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStorageInner::default())),
            retention: config.epoch_retention,
        }
    }

    /// Epoch ids currently stored for a group, ascending.
    pub fn epoch_ids(&self, group_id: &[u8]) -> Vec<u64> {
        self.lock().epochs.get(group_id).map(|e| e.keys().copied().collect()).unwrap_or_default()
    }

    /// Number of groups with stored state.
    pub fn group_count(&self) -> usize {
        self.lock().states.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupStateStorage for MemoryStorage {
    async fn state(&self, group_id: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().states.get(group_id).cloned())
    }

    async fn epoch(&self, group_id: &[u8], epoch_id: u64) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().epochs.get(group_id).and_then(|e| e.get(&epoch_id)).cloned())
    }

    async fn write(
        &self,
        state_id: &[u8],
        state_data: &[u8],
        epoch_inserts: &[EpochRecord],
        epoch_updates: &[EpochRecord],
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.states.insert(state_id.to_vec(), state_data.to_vec());

        let epochs = inner.epochs.entry(state_id.to_vec()).or_default();
        for record in epoch_inserts.iter().chain(epoch_updates) {
            epochs.insert(record.id, record.data.clone());
        }

        let floor = epoch_inserts
            .iter()
            .map(|r| r.id)
            .max()
            .and_then(|max| retention_floor(max, self.retention));
        if let Some(floor) = floor {
            epochs.retain(|id, _| *id > floor);
        }
        Ok(())
    }

    async fn max_epoch_id(&self, group_id: &[u8]) -> Result<Option<u64>, StorageError> {
        Ok(self.lock().epochs.get(group_id).and_then(|e| e.keys().next_back().copied()))
    }

    async fn delete_group(&self, group_id: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.states.remove(group_id);
        inner.epochs.remove(group_id);
        Ok(())
    }
}

#[async_trait]
impl LocalViewStore for MemoryStorage {
    async fn load_local_view(
        &self,
        stream_id: &StreamId,
    ) -> Result<Option<LocalViewSnapshot>, StorageError> {
        Ok(self.lock().local_views.get(stream_id).cloned())
    }

    async fn save_local_view(&self, snapshot: &LocalViewSnapshot) -> Result<(), StorageError> {
        self.lock().local_views.insert(snapshot.stream_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn clear_local_view(&self, stream_id: &StreamId) -> Result<(), StorageError> {
        self.lock().local_views.remove(stream_id);
        Ok(())
    }
}
