//! Stream log abstraction.
//!
//! The log orders and confirms events; it never tells the submitter whether
//! an MLS event "won". Verdicts come only from replaying confirmed events
//! into a [`RemoteView`](crate::view::RemoteView).

use async_trait::async_trait;
use cairn_proto::{ConfirmedEvent, ConfirmedSnapshot, EventId, MlsPayload, StreamId};

use crate::error::LogError;

/// Acknowledgement of a submitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Id the log assigned; the event shows up in the Remote View under it
    pub event_id: EventId,
    /// Latest miniblock at the time of submission
    pub miniblock_num: u64,
}

/// Everything a client needs to rebuild a stream's Remote View.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHistory {
    /// Most recent compaction snapshot, if any
    pub snapshot: Option<ConfirmedSnapshot>,
    /// Confirmed events (possibly including ones the snapshot already covers)
    pub events: Vec<ConfirmedEvent>,
}

/// Append-only, totally ordered event log.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Submit an MLS event to a stream.
    ///
    /// Success only means the log took the event; whether it is accepted is
    /// decided later by replay.
    async fn submit(
        &self,
        stream_id: &StreamId,
        payload: MlsPayload,
    ) -> Result<SubmitReceipt, LogError>;

    /// Fetch the latest snapshot and confirmed events of a stream.
    async fn history(&self, stream_id: &StreamId) -> Result<StreamHistory, LogError>;
}
