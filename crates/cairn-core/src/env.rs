//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples scheduling and key generation from
//! system resources (time, randomness). Production uses [`SystemEnv`]; the
//! simulation harness supplies a seeded implementation so that whole
//! multi-client runs replay bit for bit.
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Determinism: Given the same seed, `random_bytes()` produces the same
//!   sequence
//! - Isolation: Implementations must not share global state

use std::time::{Duration, Instant};

use rand::{RngCore, rngs::OsRng};

/// Abstract environment providing time, randomness, and async sleep.
///
/// # Implementations
///
/// - Simulation (`cairn-harness::SimEnv`): tokio's pausable clock, seeded
///   ChaCha RNG.
/// - Production ([`SystemEnv`]): real clock, OS entropy.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Returns the current time.
    ///
    /// Must never decrease within a single execution context.
    fn now(&self) -> Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code (the update queue's timer) sleeps; reconciliation
    /// logic never does.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// Production implementations MUST use a cryptographically secure source.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}

/// Real clock and OS entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        OsRng.fill_bytes(buffer);
    }
}
