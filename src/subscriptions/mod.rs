//! Subscriber registry and delivery channels.
//!
//! Every connected reader owns the receiving end of a bounded channel. The
//! hub offers each new message to every subscriber without blocking; a reader
//! whose channel is full is dropped and must resynchronize from history.
//!
//! # Example
//!
//! ```ignore
//! let handle = hub.subscribe();
//!
//! loop {
//!     match handle.recv() {
//!         Ok(ChatEvent::Message { message }) => render(&message),
//!         Ok(ChatEvent::CaughtUp { .. }) => {}
//!         Ok(ChatEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod registry;
mod types;

pub use registry::{DeliveryOutcome, SubscriberRegistry};
pub use types::{ChatEvent, DropReason, MessageIter, SubscriptionHandle};
