//! Message bus
//!
//! Explicit publish/subscribe object passed by reference to the components
//! that need it, replacing process-global listener registries. Every
//! subscription is tagged with an owner so a component tearing down can
//! remove all of its subscriptions in one call, which keeps reconnect
//! cycles from leaking listeners.

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

struct Subscriber<E> {
    id: u64,
    owner: String,
    callback: Box<dyn Fn(&E) + Send>,
}

/// A simple synchronous fanout bus over events of type `E`.
pub struct MessageBus<E> {
    next_id: u64,
    subscribers: Vec<Subscriber<E>>,
}

impl<E> Default for MessageBus<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            subscribers: Vec::new(),
        }
    }
}

impl<E> MessageBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a callback under the given owner tag.
    pub fn subscribe<F>(&mut self, owner: &str, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;
        self.subscribers.push(Subscriber {
            id,
            owner: owner.to_string(),
            callback: Box::new(callback),
        });
        Subscription(id)
    }

    /// Remove one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != subscription.0);
        self.subscribers.len() != before
    }

    /// Remove every subscription registered under the owner tag. Returns
    /// the number removed.
    pub fn remove_owner(&mut self, owner: &str) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.owner != owner);
        before - self.subscribers.len()
    }

    /// Deliver an event to every subscriber, in subscription order.
    pub fn publish(&self, event: &E) {
        for subscriber in &self.subscribers {
            (subscriber.callback)(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<E> std::fmt::Debug for MessageBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let mut bus: MessageBus<u32> = MessageBus::new();
        let sum = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let sum = sum.clone();
            bus.subscribe("test", move |event| {
                sum.fetch_add(*event as usize, Ordering::SeqCst);
            });
        }
        bus.publish(&5);
        assert_eq!(sum.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn test_unsubscribe() {
        let mut bus: MessageBus<u32> = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let subscription = bus.subscribe("test", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&1);
        assert!(bus.unsubscribe(subscription));
        assert!(!bus.unsubscribe(subscription));
        bus.publish(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_owner_teardown_removes_all() {
        let mut bus: MessageBus<u32> = MessageBus::new();
        bus.subscribe("conn-1", |_| {});
        bus.subscribe("conn-1", |_| {});
        bus.subscribe("conn-2", |_| {});
        assert_eq!(bus.remove_owner("conn-1"), 2);
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.remove_owner("conn-1"), 0);
    }
}
