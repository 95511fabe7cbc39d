//! Tunables for the queue, processor and storage.

use std::time::Duration;

/// Delay between a tick being requested and it running.
pub const DEFAULT_TICK_DELAY: Duration = Duration::from_millis(15);

/// How long `encrypt_message` waits for the group to become active.
pub const DEFAULT_ENCRYPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of most recent epochs kept by group state storage.
pub const DEFAULT_EPOCH_RETENTION: u64 = 3;

/// Update queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delay before a requested tick fires
    pub delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { delay: DEFAULT_TICK_DELAY }
    }
}

/// Processor configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Create or join the group automatically after each reconciliation
    pub auto_join: bool,
    /// Publish sealed epoch secrets automatically while active
    pub announce_epoch_secrets: bool,
    /// Default wait for an active group in `encrypt_message` (`None` waits
    /// forever)
    pub encrypt_timeout: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            auto_join: true,
            announce_epoch_secrets: true,
            encrypt_timeout: Some(DEFAULT_ENCRYPT_TIMEOUT),
        }
    }
}

impl ProcessorConfig {
    /// Configuration for callers that drive joins and announcements
    /// themselves.
    pub fn manual() -> Self {
        Self { auto_join: false, announce_epoch_secrets: false, ..Self::default() }
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Epoch records kept per group; older ones are evicted on write
    pub epoch_retention: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { epoch_retention: DEFAULT_EPOCH_RETENTION }
    }
}
