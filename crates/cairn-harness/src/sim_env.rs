//! Seeded Environment implementation for deterministic testing.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use cairn_core::Environment;
use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Simulation environment using tokio's pausable clock and a seeded RNG.
///
/// - **Virtual Time**: `now()` and `sleep()` go through tokio's clock. Under
///   `#[tokio::test(start_paused = true)]` time only advances when every task
///   is idle, so timers fire instantly and in a fixed order.
///
/// - **Seeded RNG**: `random_bytes()` draws from a ChaCha20Rng, so the same
///   seed reproduces the same group ids, secrets and log shuffles.
///
/// Clones share the RNG, keeping one sequence per simulated world.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// Create a SimEnv with the default seed (0).
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Create a SimEnv with a specific seed.
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))) }
    }

    /// Derive an independent environment, e.g. one per simulated client.
    pub fn fork(&self) -> Self {
        Self::with_seed(self.random_u64())
    }

    /// RNG adapter for APIs that take `RngCore + CryptoRng`.
    pub fn rng(&self) -> EnvRng<Self> {
        EnvRng(self.clone())
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

/// `RngCore` over an [`Environment`]'s random source.
pub struct EnvRng<Env>(pub Env);

impl<Env: Environment> RngCore for EnvRng<Env> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.0.random_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        self.0.random_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.random_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.random_bytes(dest);
        Ok(())
    }
}

// Environments are required to back random_bytes with a CSPRNG.
impl<Env: Environment> CryptoRng for EnvRng<Env> {}
