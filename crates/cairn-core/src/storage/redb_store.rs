use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use cairn_proto::{StreamId, codec};
use redb::{Database, ReadableTable, TableDefinition};

use super::{
    EpochRecord, GroupStateStorage, LocalViewSnapshot, LocalViewStore, retention_floor,
};
use crate::{config::StorageConfig, error::StorageError};

const GROUP_STATES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("group_states");

/// Keyed by `hex(group_id):epoch` with the epoch zero-padded, so one group's
/// epochs are a contiguous, numerically ordered key range.
const GROUP_EPOCHS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_epochs");

const LOCAL_VIEWS: TableDefinition<&str, &[u8]> = TableDefinition::new("local_views");

/// redb-backed storage.
///
/// Each [`GroupStateStorage::write`] runs in a single write transaction, so
/// state, epoch records and eviction land together or not at all.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
    retention: u64,
}

impl RedbStorage {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self, StorageError> {
        let db = Database::create(path).map_err(StorageError::backend)?;

        let txn = db.begin_write().map_err(StorageError::backend)?;
        {
            txn.open_table(GROUP_STATES).map_err(StorageError::backend)?;
            txn.open_table(GROUP_EPOCHS).map_err(StorageError::backend)?;
            txn.open_table(LOCAL_VIEWS).map_err(StorageError::backend)?;
        }
        txn.commit().map_err(StorageError::backend)?;

        Ok(Self { db: Arc::new(db), retention: config.epoch_retention })
    }

    /// Epoch ids currently stored for a group, ascending.
    pub fn epoch_ids(&self, group_id: &[u8]) -> Result<Vec<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(GROUP_EPOCHS).map_err(StorageError::backend)?;

        let (start, end) = group_range(group_id);
        let mut ids = Vec::new();
        for entry in table.range(start.as_str()..end.as_str()).map_err(StorageError::backend)? {
            let (key, _) = entry.map_err(StorageError::backend)?;
            ids.push(parse_epoch(key.value())?);
        }
        Ok(ids)
    }
}

fn epoch_key(group_id: &[u8], epoch: u64) -> String {
    format!("{}:{epoch:020}", hex::encode(group_id))
}

// ';' sorts directly after ':'
fn group_range(group_id: &[u8]) -> (String, String) {
    let prefix = hex::encode(group_id);
    (format!("{prefix}:"), format!("{prefix};"))
}

fn parse_epoch(key: &str) -> Result<u64, StorageError> {
    key.rsplit_once(':')
        .and_then(|(_, epoch)| epoch.parse().ok())
        .ok_or_else(|| StorageError::Corrupt(format!("bad epoch key {key}")))
}

#[async_trait]
impl GroupStateStorage for RedbStorage {
    async fn state(&self, group_id: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(GROUP_STATES).map_err(StorageError::backend)?;
        let value = table.get(group_id).map_err(StorageError::backend)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    async fn epoch(&self, group_id: &[u8], epoch_id: u64) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(GROUP_EPOCHS).map_err(StorageError::backend)?;
        let key = epoch_key(group_id, epoch_id);
        let value = table.get(key.as_str()).map_err(StorageError::backend)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    async fn write(
        &self,
        state_id: &[u8],
        state_data: &[u8],
        epoch_inserts: &[EpochRecord],
        epoch_updates: &[EpochRecord],
    ) -> Result<(), StorageError> {
        let floor = epoch_inserts
            .iter()
            .map(|r| r.id)
            .max()
            .and_then(|max| retention_floor(max, self.retention));

        let txn = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut states = txn.open_table(GROUP_STATES).map_err(StorageError::backend)?;
            states.insert(state_id, state_data).map_err(StorageError::backend)?;

            let mut epochs = txn.open_table(GROUP_EPOCHS).map_err(StorageError::backend)?;
            for record in epoch_inserts.iter().chain(epoch_updates) {
                let key = epoch_key(state_id, record.id);
                epochs.insert(key.as_str(), record.data.as_slice()).map_err(StorageError::backend)?;
            }

            if let Some(floor) = floor {
                let start = epoch_key(state_id, 0);
                let end = epoch_key(state_id, floor);
                let mut stale = Vec::new();
                for entry in
                    epochs.range(start.as_str()..=end.as_str()).map_err(StorageError::backend)?
                {
                    let (key, _) = entry.map_err(StorageError::backend)?;
                    stale.push(key.value().to_owned());
                }
                for key in stale {
                    epochs.remove(key.as_str()).map_err(StorageError::backend)?;
                }
            }
        }
        txn.commit().map_err(StorageError::backend)?;
        Ok(())
    }

    async fn max_epoch_id(&self, group_id: &[u8]) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(GROUP_EPOCHS).map_err(StorageError::backend)?;

        let (start, end) = group_range(group_id);
        let mut range = table.range(start.as_str()..end.as_str()).map_err(StorageError::backend)?;
        match range.next_back() {
            Some(entry) => {
                let (key, _) = entry.map_err(StorageError::backend)?;
                parse_epoch(key.value()).map(Some)
            },
            None => Ok(None),
        }
    }

    async fn delete_group(&self, group_id: &[u8]) -> Result<(), StorageError> {
        let (start, end) = group_range(group_id);

        let txn = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut states = txn.open_table(GROUP_STATES).map_err(StorageError::backend)?;
            states.remove(group_id).map_err(StorageError::backend)?;

            let mut epochs = txn.open_table(GROUP_EPOCHS).map_err(StorageError::backend)?;
            let mut keys = Vec::new();
            for entry in epochs.range(start.as_str()..end.as_str()).map_err(StorageError::backend)? {
                let (key, _) = entry.map_err(StorageError::backend)?;
                keys.push(key.value().to_owned());
            }
            for key in keys {
                epochs.remove(key.as_str()).map_err(StorageError::backend)?;
            }
        }
        txn.commit().map_err(StorageError::backend)
    }
}

#[async_trait]
impl LocalViewStore for RedbStorage {
    async fn load_local_view(
        &self,
        stream_id: &StreamId,
    ) -> Result<Option<LocalViewSnapshot>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(LOCAL_VIEWS).map_err(StorageError::backend)?;
        let Some(value) = table.get(stream_id.as_str()).map_err(StorageError::backend)? else {
            return Ok(None);
        };

        codec::decode(value.value()).map(Some).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    async fn save_local_view(&self, snapshot: &LocalViewSnapshot) -> Result<(), StorageError> {
        let bytes = codec::encode(snapshot).map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let txn = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut table = txn.open_table(LOCAL_VIEWS).map_err(StorageError::backend)?;
            table
                .insert(snapshot.stream_id.as_str(), bytes.as_slice())
                .map_err(StorageError::backend)?;
        }
        txn.commit().map_err(StorageError::backend)
    }

    async fn clear_local_view(&self, stream_id: &StreamId) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut table = txn.open_table(LOCAL_VIEWS).map_err(StorageError::backend)?;
            table.remove(stream_id.as_str()).map_err(StorageError::backend)?;
        }
        txn.commit().map_err(StorageError::backend)
    }
}
