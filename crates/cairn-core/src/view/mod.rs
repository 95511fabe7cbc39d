//! Remote and local views of a stream's MLS group.
//!
//! - [`RemoteView`] replays confirmed log events into accept/reject verdicts.
//!   It is pure bookkeeping over public data and can be rebuilt from the log
//!   at any time.
//! - [`LocalView`] wraps the group this client holds and follows the Remote
//!   View's commits, recording every epoch secret it passes through.

mod local;
mod remote;

pub use local::{LocalEpochSecret, LocalView, LocalViewStatus, PendingInfo};
pub use remote::{RemoteGroupInfo, RemoteView, RemoteViewDigest};
