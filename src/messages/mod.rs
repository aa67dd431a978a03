//! Durable message log.
//!
//! Messages are framed and checksummed in an append-only log over an
//! injected [`LogBackend`]. An in-memory sequence index is rebuilt on open
//! for O(1) access by sequence number.

mod backend;
mod index;
mod log;
mod store;

pub use backend::{FileLogBackend, LogBackend, MemoryLogBackend};
pub use index::SequenceIndex;
pub use log::{FramePosition, MessageLog};
pub use store::{LogStats, MessageStore};
