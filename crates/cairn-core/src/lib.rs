//! Cairn group-session reconciliation
//!
//! Keeps each client's MLS group state consistent with the authoritative,
//! replicated stream log. The log is the only arbiter: whatever it confirmed
//! first wins, and every client replays the same confirmed events into the
//! same verdicts.
//!
//! # Architecture
//!
//! ```text
//!   stream log ──► UpdateQueue ──► Processor ──► RemoteView  (what the log says)
//!                  (one tick       │              │ accepted / rejected
//!                   at a time)     │              │ commits by epoch
//!                                  │              ▼
//!                                  └──────────► LocalView   (what we hold)
//!                                                 pending ─► active ─► corrupted
//!                                                    └─────► rejected
//! ```
//!
//! The MLS engine, the log and durable storage are collaborators reached
//! through traits ([`mls::GroupEngine`], [`log::EventLog`],
//! [`storage::GroupStateStorage`]). Nothing here talks to the network or the
//! filesystem directly except the redb storage adapter.
//!
//! # Components
//!
//! - [`view`]: Remote View (log-derived verdicts) and Local View (our group)
//! - [`processor`]: per-stream state, join/announce/encrypt/decrypt
//! - [`queue`]: cooperative per-client scheduler for stream updates
//! - [`storage`]: group state and Local View persistence (memory, redb)
//! - [`mod@env`]: Environment abstraction (time, RNG)
//! - [`error`]: error taxonomy

pub mod config;
pub mod env;
pub mod error;
pub mod log;
pub mod mls;
pub mod processor;
pub mod queue;
pub mod storage;
pub mod stream;
pub mod view;

pub use config::{ProcessorConfig, QueueConfig, StorageConfig};
pub use env::{Environment, SystemEnv};
pub use error::{
    DecryptionError, DecryptionFailureReason, EngineError, LogError, ProcessorError, StorageError,
};
pub use log::{EventLog, StreamHistory, SubmitReceipt};
pub use mls::{
    AddMemberOutput, ExternalGroupSession, ExternalJoinOutput, GroupEngine, GroupSession,
    ProcessedMessage,
};
pub use processor::Processor;
pub use queue::{StreamUpdate, StreamUpdateDelegate, UpdateQueue};
pub use storage::{
    EpochRecord, GroupStateStorage, LocalViewSnapshot, LocalViewStore, MemoryStorage,
    ProcessorStore, RedbStorage,
};
pub use view::{
    LocalEpochSecret, LocalView, LocalViewStatus, PendingInfo, RemoteGroupInfo, RemoteView,
    RemoteViewDigest,
};
