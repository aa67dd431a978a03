//! Registry of connected readers and their delivery cursors.

use crate::error::{ChatError, Result};
use crate::types::{Message, Sequence, SubscriberId};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::types::{ChatEvent, DropReason, SubscriptionHandle};

/// Result of offering one message to one subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Enqueued on the delivery channel.
    Delivered,
    /// The subscriber's cursor was already at or past the message.
    Skipped,
    /// The channel was full.
    Overflow,
    /// The reader dropped its handle.
    Disconnected,
}

/// Internal subscriber state.
struct Subscriber {
    /// Last sequence delivered.
    cursor: AtomicU64,
    sender: Sender<ChatEvent>,
    /// Usable capacity for messages. The channel has two extra slots: one
    /// for `CaughtUp` and one so a final `Dropped` event always fits.
    capacity: usize,
    /// Whether catch-up is complete. Live fan-out skips pending subscribers.
    caught_up: AtomicBool,
}

impl Subscriber {
    fn cursor(&self) -> Sequence {
        Sequence(self.cursor.load(Ordering::Acquire))
    }

    /// Try to enqueue without blocking.
    fn offer(&self, event: ChatEvent) -> DeliveryOutcome {
        if self.sender.len() >= self.capacity {
            return DeliveryOutcome::Overflow;
        }
        match self.sender.try_send(event) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(TrySendError::Full(_)) => DeliveryOutcome::Overflow,
            Err(TrySendError::Disconnected(_)) => DeliveryOutcome::Disconnected,
        }
    }

    /// Best-effort final event.
    fn notify_dropped(&self, reason: DropReason) {
        let _ = self.sender.try_send(ChatEvent::Dropped { reason });
    }
}

/// Tracks live readers. Pure in-memory bookkeeping.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    /// Counter for generating subscriber IDs.
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a live subscriber whose cursor starts at `cursor`.
    pub fn register(&self, cursor: Sequence, capacity: usize) -> SubscriptionHandle {
        self.insert(cursor, capacity, true)
    }

    /// Register a subscriber that still needs a historical replay.
    ///
    /// It receives nothing from live fan-out until [`mark_caught_up`] is called.
    ///
    /// [`mark_caught_up`]: SubscriberRegistry::mark_caught_up
    pub fn register_pending(&self, cursor: Sequence, capacity: usize) -> SubscriptionHandle {
        self.insert(cursor, capacity, false)
    }

    fn insert(&self, cursor: Sequence, capacity: usize, caught_up: bool) -> SubscriptionHandle {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity + 2);

        let subscriber = Subscriber {
            cursor: AtomicU64::new(cursor.0),
            sender,
            capacity,
            caught_up: AtomicBool::new(caught_up),
        };
        self.subscribers.write().insert(id, subscriber);

        debug!(subscriber = %id, cursor = cursor.0, capacity, "Registered subscriber");
        SubscriptionHandle { id, receiver }
    }

    /// Remove a subscriber and release its channel. Idempotent.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        self.drop_subscriber(id, DropReason::Unsubscribed)
    }

    /// Remove a subscriber, telling it why. Returns false if it was not present.
    pub fn drop_subscriber(&self, id: SubscriberId, reason: DropReason) -> bool {
        let removed = self.subscribers.write().remove(&id);
        match removed {
            Some(sub) => {
                debug!(subscriber = %id, ?reason, "Dropped subscriber");
                sub.notify_dropped(reason);
                true
            }
            None => false,
        }
    }

    /// Drop every subscriber.
    pub fn drop_all(&self, reason: DropReason) -> usize {
        let drained: Vec<_> = self.subscribers.write().drain().collect();
        for (_, sub) in &drained {
            sub.notify_dropped(reason.clone());
        }
        drained.len()
    }

    /// Move a subscriber's cursor forward after a successful delivery.
    ///
    /// Never moves it backwards.
    pub fn advance_cursor(&self, id: SubscriberId, sequence: Sequence) -> Result<()> {
        let subs = self.subscribers.read();
        let sub = subs.get(&id).ok_or(ChatError::UnknownSubscriber(id))?;
        sub.cursor.fetch_max(sequence.0, Ordering::AcqRel);
        Ok(())
    }

    pub fn cursor(&self, id: SubscriberId) -> Option<Sequence> {
        self.subscribers.read().get(&id).map(Subscriber::cursor)
    }

    /// Offer a message to every caught-up subscriber whose cursor is behind it.
    ///
    /// Never blocks. Cursors are not advanced here.
    pub fn enqueue_all(&self, message: &Arc<Message>) -> Vec<(SubscriberId, DeliveryOutcome)> {
        let subs = self.subscribers.read();
        subs.iter()
            .filter(|(_, sub)| sub.caught_up.load(Ordering::Acquire))
            .map(|(id, sub)| {
                let outcome = if sub.cursor() >= message.sequence {
                    DeliveryOutcome::Skipped
                } else {
                    sub.offer(ChatEvent::Message {
                        message: Arc::clone(message),
                    })
                };
                (*id, outcome)
            })
            .collect()
    }

    /// Send an event to one subscriber (for catch-up).
    pub fn send_to(&self, id: SubscriberId, event: ChatEvent) -> Result<()> {
        let subs = self.subscribers.read();
        let sub = subs.get(&id).ok_or(ChatError::UnknownSubscriber(id))?;
        match sub.offer(event) {
            DeliveryOutcome::Delivered | DeliveryOutcome::Skipped => Ok(()),
            DeliveryOutcome::Overflow => Err(ChatError::ChannelOverflow(id)),
            DeliveryOutcome::Disconnected => Err(ChatError::UnknownSubscriber(id)),
        }
    }

    /// Finish catch-up: send `CaughtUp` and start live delivery.
    pub fn mark_caught_up(&self, id: SubscriberId) -> Result<()> {
        let subs = self.subscribers.read();
        let sub = subs.get(&id).ok_or(ChatError::UnknownSubscriber(id))?;
        // Uses the reserved slot, not the message capacity.
        match sub.sender.try_send(ChatEvent::CaughtUp {
            cursor: sub.cursor(),
        }) {
            Ok(()) => {
                sub.caught_up.store(true, Ordering::Release);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(ChatError::ChannelOverflow(id)),
            Err(TrySendError::Disconnected(_)) => Err(ChatError::UnknownSubscriber(id)),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().contains_key(&id)
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use std::thread;
    use std::time::Duration;

    fn message(seq: u64) -> Arc<Message> {
        Arc::new(Message {
            sequence: Sequence(seq),
            sender_id: "alice".into(),
            text: format!("m{}", seq),
            attachment: None,
            created_at: Timestamp::now(),
        })
    }

    #[test]
    fn test_register_unregister() {
        let registry = SubscriberRegistry::new();

        let handle = registry.register(Sequence(5), 8);
        assert_eq!(registry.subscriber_count(), 1);
        assert_eq!(registry.cursor(handle.id), Some(Sequence(5)));

        assert!(registry.unregister(handle.id));
        assert_eq!(registry.subscriber_count(), 0);
        // Idempotent
        assert!(!registry.unregister(handle.id));

        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            ChatEvent::Dropped { reason } => assert_eq!(reason, DropReason::Unsubscribed),
            other => panic!("Expected Dropped event, got {:?}", other),
        }
    }

    #[test]
    fn test_advance_cursor_is_monotonic() {
        let registry = SubscriberRegistry::new();
        let handle = registry.register(Sequence(0), 8);

        registry.advance_cursor(handle.id, Sequence(3)).unwrap();
        registry.advance_cursor(handle.id, Sequence(2)).unwrap();
        assert_eq!(registry.cursor(handle.id), Some(Sequence(3)));
    }

    #[test]
    fn test_advance_unknown_subscriber() {
        let registry = SubscriberRegistry::new();
        let handle = registry.register(Sequence(0), 8);
        registry.unregister(handle.id);

        let result = registry.advance_cursor(handle.id, Sequence(1));
        assert!(matches!(result, Err(ChatError::UnknownSubscriber(id)) if id == handle.id));
    }

    #[test]
    fn test_enqueue_skips_subscribers_ahead() {
        let registry = SubscriberRegistry::new();
        let behind = registry.register(Sequence(0), 8);
        let ahead = registry.register(Sequence(1), 8);

        let outcomes: HashMap<_, _> = registry.enqueue_all(&message(1)).into_iter().collect();
        assert_eq!(outcomes[&behind.id], DeliveryOutcome::Delivered);
        assert_eq!(outcomes[&ahead.id], DeliveryOutcome::Skipped);

        match behind.try_recv().unwrap() {
            ChatEvent::Message { message } => assert_eq!(message.sequence, Sequence(1)),
            other => panic!("Expected Message event, got {:?}", other),
        }
        assert!(ahead.try_recv().is_err());
    }

    #[test]
    fn test_overflow_leaves_room_for_dropped_event() {
        let registry = SubscriberRegistry::new();
        let handle = registry.register(Sequence(0), 2);

        for seq in 1..=2 {
            let outcomes = registry.enqueue_all(&message(seq));
            assert_eq!(outcomes[0].1, DeliveryOutcome::Delivered);
            registry.advance_cursor(handle.id, Sequence(seq)).unwrap();
        }
        let outcomes = registry.enqueue_all(&message(3));
        assert_eq!(outcomes[0].1, DeliveryOutcome::Overflow);

        registry.drop_subscriber(
            handle.id,
            DropReason::BufferOverflow {
                last_delivered: Sequence(2),
            },
        );

        let events: Vec<_> = handle.receiver.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            ChatEvent::Dropped {
                reason: DropReason::BufferOverflow {
                    last_delivered: Sequence(2)
                }
            }
        );
    }

    #[test]
    fn test_caught_up_fits_after_full_backlog() {
        let registry = SubscriberRegistry::new();
        let handle = registry.register_pending(Sequence(0), 2);

        for seq in 1..=2 {
            registry
                .send_to(handle.id, ChatEvent::Message { message: message(seq) })
                .unwrap();
            registry.advance_cursor(handle.id, Sequence(seq)).unwrap();
        }
        assert!(matches!(
            registry.send_to(handle.id, ChatEvent::Message { message: message(3) }),
            Err(ChatError::ChannelOverflow(_))
        ));
        registry.mark_caught_up(handle.id).unwrap();

        // Still room for the final Dropped event
        registry.drop_subscriber(
            handle.id,
            DropReason::BufferOverflow {
                last_delivered: Sequence(2),
            },
        );
        let events: Vec<_> = handle.receiver.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert_eq!(events[2], ChatEvent::CaughtUp { cursor: Sequence(2) });
        assert!(matches!(events[3], ChatEvent::Dropped { .. }));
    }

    #[test]
    fn test_disconnected_reader_detected() {
        let registry = SubscriberRegistry::new();
        let handle = registry.register(Sequence(0), 4);
        let id = handle.id;
        drop(handle);

        let outcomes = registry.enqueue_all(&message(1));
        assert_eq!(outcomes, vec![(id, DeliveryOutcome::Disconnected)]);
    }

    #[test]
    fn test_pending_subscriber_not_live_until_caught_up() {
        let registry = SubscriberRegistry::new();
        let handle = registry.register_pending(Sequence(0), 8);

        assert!(registry.enqueue_all(&message(1)).is_empty());

        registry
            .send_to(handle.id, ChatEvent::Message { message: message(1) })
            .unwrap();
        registry.advance_cursor(handle.id, Sequence(1)).unwrap();
        registry.mark_caught_up(handle.id).unwrap();

        let outcomes = registry.enqueue_all(&message(2));
        assert_eq!(outcomes, vec![(handle.id, DeliveryOutcome::Delivered)]);

        let events: Vec<_> = handle.receiver.try_iter().collect();
        assert!(matches!(events[1], ChatEvent::CaughtUp { cursor } if cursor == Sequence(1)));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_concurrent_register_and_unregister() {
        let registry = Arc::new(SubscriberRegistry::new());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let handle = registry.register(Sequence(0), 4);
                        registry.enqueue_all(&message(1));
                        let _ = registry.advance_cursor(handle.id, Sequence(1));
                        registry.unregister(handle.id);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_all() {
        let registry = SubscriberRegistry::new();
        let a = registry.register(Sequence(0), 4);
        let _b = registry.register(Sequence(0), 4);

        assert_eq!(registry.drop_all(DropReason::Shutdown), 2);
        assert_eq!(registry.subscriber_count(), 0);
        assert!(matches!(
            a.try_recv().unwrap(),
            ChatEvent::Dropped { reason: DropReason::Shutdown }
        ));
    }
}
