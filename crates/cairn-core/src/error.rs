//! Error taxonomy for group-session reconciliation.
//!
//! Losing an MLS race is not an error: it shows up as
//! [`LocalViewStatus::Rejected`](crate::view::LocalViewStatus::Rejected) and
//! the next pass simply tries again. What remains here:
//!
//! - Cryptographic desync ([`ProcessorError::Corrupted`]): our group can no
//!   longer follow the confirmed commits. The only class that discards client
//!   state.
//! - Decryption failure ([`DecryptionError`]): recorded per message and
//!   retried when the missing epoch secret shows up.
//! - Timeout ([`ProcessorError::Timeout`]).
//! - Transport and storage failures, propagated from direct calls.

use std::time::Duration;

use cairn_crypto::CryptoError;
use cairn_proto::{EventId, ProtocolError, StreamId};
use thiserror::Error;

/// Errors raised by the MLS group engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Commit was built for a different epoch than the group is in
    #[error("commit targets epoch {commit_epoch}, group is at epoch {group_epoch}")]
    EpochMismatch {
        /// Epoch the commit was built against
        commit_epoch: u64,
        /// Epoch the group is currently in
        group_epoch: u64,
    },

    /// Commit is well formed but does not apply to this group state
    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    /// Group state, snapshot or group info could not be interpreted
    #[error("invalid group state: {0}")]
    InvalidState(String),

    /// No stored key package matches any welcome recipient
    #[error("welcome is not addressed to any of our key packages")]
    NoMatchingKeyPackage,

    /// Epoch encryption failed inside the engine
    #[error("engine crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Encoding or decoding engine messages failed
    #[error("engine encoding failure: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors raised by the stream log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    /// Log could not be reached; safe to retry
    #[error("log unavailable: {0}")]
    Unavailable(String),

    /// Stream does not exist on the log
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Log refused the submission outright
    #[error("submission refused: {0}")]
    Refused(String),
}

impl LogError {
    /// Whether the same submission may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors raised by persistence adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Backend (redb) failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Stored bytes could not be decoded
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Why a message could not be decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptionFailureReason {
    /// This client holds no group for the stream yet
    #[error("no group session for stream")]
    NoGroup,

    /// The epoch's secret is not (yet) known locally
    #[error("missing epoch secret")]
    MissingEpochSecret,

    /// Ciphertext failed to open under the epoch keys
    #[error("{0}")]
    Crypto(CryptoError),

    /// Envelope or plaintext could not be decoded
    #[error("{0}")]
    Envelope(ProtocolError),
}

/// A message that failed to decrypt, with enough context to retry or
/// report it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to decrypt event {event_id} in stream {stream_id} at epoch {epoch}: {reason}")]
pub struct DecryptionError {
    /// Stream the message belongs to
    pub stream_id: StreamId,
    /// Event carrying the message
    pub event_id: EventId,
    /// Epoch named by the envelope
    pub epoch: u64,
    /// Failure detail
    pub reason: DecryptionFailureReason,
}

impl DecryptionError {
    /// Whether a later epoch secret announcement may fix this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.reason,
            DecryptionFailureReason::NoGroup | DecryptionFailureReason::MissingEpochSecret
        )
    }

    /// Message suitable for showing in place of the plaintext.
    pub fn user_message(&self) -> &'static str {
        match self.reason {
            DecryptionFailureReason::NoGroup | DecryptionFailureReason::MissingEpochSecret => {
                "Waiting for the keys for this message."
            },
            DecryptionFailureReason::Crypto(_) | DecryptionFailureReason::Envelope(_) => {
                "Unable to decrypt this message."
            },
        }
    }
}

/// Errors raised by processor operations.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Local group diverged from the confirmed commits
    #[error("local view for stream {stream_id} is corrupted (epoch {epoch:?})")]
    Corrupted {
        /// Affected stream
        stream_id: StreamId,
        /// Epoch whose commit failed to apply
        epoch: Option<u64>,
    },

    /// Operation needs an active group session
    #[error("stream {stream_id} has no active group session")]
    NotActive {
        /// Affected stream
        stream_id: StreamId,
    },

    /// Active but no secret for the current epoch
    #[error("no epoch secret for stream {stream_id}")]
    NoEpochSecret {
        /// Affected stream
        stream_id: StreamId,
    },

    /// Waited too long for the group to become active
    #[error("timed out after {elapsed:?} waiting for stream {stream_id}")]
    Timeout {
        /// Affected stream
        stream_id: StreamId,
        /// How long we waited
        elapsed: Duration,
    },

    /// Event submission failed
    #[error("submission failed: {0}")]
    Submission(#[from] LogError),

    /// Group engine failure
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Epoch encryption failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Encoding failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Message decryption failure
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
}

impl ProcessorError {
    /// Whether retrying the operation may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::NotActive { .. } => true,
            Self::Submission(e) => e.is_transient(),
            Self::Decryption(e) => e.is_retryable(),
            Self::Corrupted { .. }
            | Self::NoEpochSecret { .. }
            | Self::Engine(_)
            | Self::Storage(_)
            | Self::Crypto(_)
            | Self::Protocol(_) => false,
        }
    }
}
