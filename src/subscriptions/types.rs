//! Subscription types for live message delivery.

use crate::types::{Message, Sequence, SubscriberId};
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Events delivered to a subscriber, in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A newly appended message (or a replayed one during catch-up).
    Message { message: Arc<Message> },

    /// Historical replay finished; everything after this is live.
    CaughtUp { cursor: Sequence },

    /// The subscription ended. No further events follow.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The delivery channel filled up (slow reader). Resume with
    /// `fetch_history` from `last_delivered + 1`.
    BufferOverflow { last_delivered: Sequence },
    /// The reader dropped its handle.
    Disconnected,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The hub is shutting down.
    Shutdown,
}

/// Receiving side of a subscription.
///
/// Dropping the handle disconnects the subscriber; the hub removes it on the
/// next delivery attempt.
pub struct SubscriptionHandle {
    pub id: SubscriberId,
    /// Channel to receive events.
    pub receiver: Receiver<ChatEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<ChatEvent, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<ChatEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ChatEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Events currently buffered and not yet received.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Iterate over delivered messages, skipping `CaughtUp` and stopping at
    /// `Dropped` or when no event arrives within `idle`.
    pub fn messages(&self, idle: Duration) -> MessageIter<'_> {
        MessageIter {
            handle: self,
            idle,
            dropped: None,
        }
    }
}

/// Iterator returned by [`SubscriptionHandle::messages`].
pub struct MessageIter<'a> {
    handle: &'a SubscriptionHandle,
    idle: Duration,
    dropped: Option<DropReason>,
}

impl MessageIter<'_> {
    /// The drop reason, if iteration ended because the subscription dropped.
    pub fn drop_reason(&self) -> Option<&DropReason> {
        self.dropped.as_ref()
    }
}

impl Iterator for MessageIter<'_> {
    type Item = Arc<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dropped.is_some() {
            return None;
        }

        loop {
            match self.handle.recv_timeout(self.idle) {
                Ok(ChatEvent::Message { message }) => return Some(message),
                Ok(ChatEvent::CaughtUp { .. }) => continue,
                Ok(ChatEvent::Dropped { reason }) => {
                    self.dropped = Some(reason);
                    return None;
                }
                Err(_) => return None,
            }
        }
    }
}
