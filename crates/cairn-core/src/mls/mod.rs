//! MLS group engine seam.
//!
//! The engine owns all MLS cryptography and wire formats. Reconciliation only
//! needs the narrow surface below: build or join a group, apply commits, and
//! export the public state other clients need.

mod engine;

pub use engine::{
    AddMemberOutput, ExternalGroupSession, ExternalJoinOutput, GroupEngine, GroupSession,
    ProcessedMessage,
};
