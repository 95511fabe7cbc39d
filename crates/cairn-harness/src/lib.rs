//! Deterministic simulation harness for Cairn.
//!
//! Seeded implementations of the Environment, engine and log seams, plus a
//! multi-client [`scenario::World`] that races clients against one shared
//! log. A seed fully determines a run: group ids, secrets, the order the log
//! confirms racing submissions in, and therefore every verdict.

pub mod engine;
pub mod log;
pub mod scenario;
pub mod sim_env;

pub use engine::{SimEngine, SimExternalGroup, SimGroup};
pub use log::SimLog;
pub use scenario::{Report, Scenario, SimProcessor, World};
pub use sim_env::{EnvRng, SimEnv};
