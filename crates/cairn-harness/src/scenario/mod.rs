//! Scenario framework.
//!
//! A [`Scenario`] declares clients, streams and a number of rounds, and must
//! be given an oracle before it can run. The oracle sees a [`Report`] of
//! every client's view of every stream once the rounds are done.

mod builder;
pub mod oracle;
mod world;

pub use builder::{RunnableScenario, Scenario};
pub use world::{Report, SimClient, SimProcessor, StreamReport, World};

/// Verification run against the final report.
pub type OracleFn = Box<dyn Fn(&Report) -> Result<(), String> + Send + Sync>;
