//! # murmur
//!
//! A durable, multi-client message broadcast core: many senders submit
//! messages, every connected reader receives them in one total order, and
//! late joiners page through history.
//!
//! ## Core Concepts
//!
//! - **Messages**: Append-only, fsynced log; the store assigns sequence numbers
//! - **Subscribers**: Bounded per-reader channels with monotonic cursors
//! - **Hub**: Validates, appends, and fans out without ever blocking on readers
//! - **Attachments**: Content-addressed storage, swept when unreferenced
//!
//! ## Example
//!
//! ```ignore
//! use murmur::{BroadcastHub, ChatEvent, HubConfig};
//!
//! let hub = BroadcastHub::open_or_create(HubConfig::at("./chat"))?;
//!
//! let handle = hub.subscribe();
//! let seq = hub.submit("alice", "hi", None)?;
//!
//! // Attach an image
//! let seq = hub.submit_with_attachment("bob", "look", &png_bytes, "image/png")?;
//!
//! // Late joiner catches up
//! let history = hub.fetch_history(1, 50)?;
//! ```

pub mod attachments;
pub mod config;
pub mod error;
pub mod gc;
pub mod hub;
pub mod messages;
pub mod retry;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use attachments::{
    AttachmentStore, BlobBackend, FsBlobBackend, GcReport, MemoryBlobBackend, DEFAULT_MIME_TYPE,
};
pub use config::HubConfig;
pub use error::{ChatError, Result};
pub use gc::GcWorker;
pub use hub::BroadcastHub;
pub use messages::{FileLogBackend, LogBackend, LogStats, MemoryLogBackend, MessageStore};
pub use retry::RetryPolicy;
pub use subscriptions::{
    ChatEvent, DeliveryOutcome, DropReason, MessageIter, SubscriberRegistry, SubscriptionHandle,
};
pub use types::*;
