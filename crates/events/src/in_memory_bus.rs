//! In-memory event bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, mpsc};

use crate::bus::{BusError, EventBus, Subscription};

/// Messages buffered per subscriber before new ones are dropped for it.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// In-memory pub/sub bus.
///
/// - No IO / no async
/// - Best-effort fan-out; dropped subscribers are pruned on publish
/// - Each subscriber buffers at most `capacity` messages; a subscriber that
///   stops reading misses new messages instead of growing the buffer
/// - Publishing with no subscribers is a no-op
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::SyncSender<M>>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Messages not delivered because a subscriber's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        let mut subs = self.subscribers.lock().map_err(|_| BusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::TrySendError::Disconnected(_)) => false,
        });

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fans_out_to_every_subscriber() {
        let bus = InMemoryEventBus::<u32>::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(a.drain(), vec![1, 2]);
        assert_eq!(b.drain(), vec![1, 2]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::<u32>::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(7).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), 7);
    }

    #[test]
    fn stalled_subscriber_misses_messages_but_stays_subscribed() {
        let bus = InMemoryEventBus::<u32>::with_capacity(2);
        let stalled = bus.subscribe();

        for n in 0..5 {
            bus.publish(n).unwrap();
        }
        assert_eq!(bus.dropped(), 3);
        assert_eq!(stalled.drain(), vec![0, 1]);

        bus.publish(9).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(stalled.try_recv().unwrap(), 9);
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = InMemoryEventBus::<u32>::new();
        assert!(bus.publish(1).is_ok());
    }
}
