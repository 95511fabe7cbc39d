//! Durable storage for group state and Local Views.
//!
//! Two concerns share one backend:
//!
//! - [`GroupStateStorage`]: the engine's serialized group plus one record per
//!   epoch (its secret). Writes evict epochs that fall out of the retention
//!   window.
//! - [`LocalViewStore`]: which event a Local View waits on and where it
//!   stands, so a restarted client resumes instead of racing again.
//!
//! # Implementations
//!
//! - [`MemoryStorage`]: mutex-guarded maps for tests and simulation
//! - [`RedbStorage`]: embedded redb database, one transaction per write

mod memory;
mod redb_store;

use async_trait::async_trait;
use cairn_proto::StreamId;
use serde::{Deserialize, Serialize};

pub use self::{memory::MemoryStorage, redb_store::RedbStorage};
use crate::{
    error::StorageError,
    view::{LocalViewStatus, PendingInfo},
};

/// One stored epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochRecord {
    /// Epoch number
    pub id: u64,
    /// Opaque epoch data
    pub data: Vec<u8>,
}

/// Persisted shape of a Local View.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalViewSnapshot {
    /// Stream the view belongs to
    pub stream_id: StreamId,
    /// Group id to look up in [`GroupStateStorage`]
    pub group_id: Vec<u8>,
    /// Submission the view waits on
    pub pending_info: PendingInfo,
    /// Status at the time of saving
    pub status: LocalViewStatus,
    /// Epoch at which the view became active
    pub joined_epoch: Option<u64>,
}

/// Storage for serialized groups and their epoch records.
///
/// # Invariants
///
/// - `write` is an upsert: repeating it has no further effect
/// - After a write inserting epochs up to `m`, every epoch `<= m - retention`
///   is gone
#[async_trait]
pub trait GroupStateStorage: Send + Sync + 'static {
    /// Serialized group state.
    async fn state(&self, group_id: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stored data for one epoch.
    async fn epoch(&self, group_id: &[u8], epoch_id: u64) -> Result<Option<Vec<u8>>, StorageError>;

    /// Atomically store state, insert and update epoch records, and evict
    /// epochs outside the retention window.
    async fn write(
        &self,
        state_id: &[u8],
        state_data: &[u8],
        epoch_inserts: &[EpochRecord],
        epoch_updates: &[EpochRecord],
    ) -> Result<(), StorageError>;

    /// Highest stored epoch for a group.
    async fn max_epoch_id(&self, group_id: &[u8]) -> Result<Option<u64>, StorageError>;

    /// Remove a group's state and every epoch record. No-op for an unknown
    /// group.
    async fn delete_group(&self, group_id: &[u8]) -> Result<(), StorageError>;
}

/// Storage for Local View snapshots.
#[async_trait]
pub trait LocalViewStore: Send + Sync + 'static {
    /// Saved snapshot for a stream.
    async fn load_local_view(
        &self,
        stream_id: &StreamId,
    ) -> Result<Option<LocalViewSnapshot>, StorageError>;

    /// Save (replace) a stream's snapshot.
    async fn save_local_view(&self, snapshot: &LocalViewSnapshot) -> Result<(), StorageError>;

    /// Forget a stream's snapshot.
    async fn clear_local_view(&self, stream_id: &StreamId) -> Result<(), StorageError>;
}

/// Everything the processor persists.
pub trait ProcessorStore: GroupStateStorage + LocalViewStore {}

impl<T: GroupStateStorage + LocalViewStore> ProcessorStore for T {}

/// Highest epoch evicted after inserting up to `max_inserted`.
pub(crate) fn retention_floor(max_inserted: u64, retention: u64) -> Option<u64> {
    max_inserted.checked_sub(retention)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_stays_empty_until_window_fills() {
        assert_eq!(retention_floor(2, 3), None);
        assert_eq!(retention_floor(3, 3), Some(0));
        assert_eq!(retention_floor(10, 3), Some(7));
    }
}
