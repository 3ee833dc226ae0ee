//! In-process fan-out registry.
//!
//! The hub maps a [`Topic`] to the live subscriber channels registered on it
//! in this process. Broadcasting never waits on a subscriber: a full buffer
//! drops that delivery for that subscriber only.

use courier_protocol::Event;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::metrics;

/// Maximum topic identifier length.
pub const MAX_TOPIC_ID_LENGTH: usize = 256;

/// Validate a room or user identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_topic_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("identifier cannot be empty");
    }
    if id.len() > MAX_TOPIC_ID_LENGTH {
        return Err("identifier too long");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && c != ' ') {
        return Err("identifier contains invalid characters");
    }
    Ok(())
}

/// A fan-out key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A chat room.
    Room(String),
    /// A single user's notification feed.
    User(String),
}

impl Topic {
    /// Topic for a chat room.
    #[must_use]
    pub fn room(id: impl Into<String>) -> Self {
        Topic::Room(id.into())
    }

    /// Topic for a user.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Topic::User(id.into())
    }

    /// The topic an event is fanned out on.
    #[must_use]
    pub fn for_event(event: &Event) -> Self {
        match event {
            Event::Message(m) => Topic::room(m.room_id.clone()),
            Event::Notification(n) => Topic::user(n.user_id.clone()),
        }
    }

    /// The bare room or user identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Topic::Room(id) | Topic::User(id) => id,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Room(id) => write!(f, "room:{id}"),
            Topic::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Identifier of one registration.
pub type SubscriberId = u64;

/// Sending half of a subscriber channel.
pub type SubscriberSender = mpsc::Sender<Arc<Event>>;

/// Receiving half of a subscriber channel.
pub type SubscriberReceiver = mpsc::Receiver<Arc<Event>>;

/// Handle returned by [`Hub::register`], used to unregister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topic: Topic,
    id: SubscriberId,
}

impl Subscription {
    /// The topic this registration is on.
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// The registration identifier.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Subscribers the event was queued for.
    pub delivered: usize,
    /// Subscribers whose buffer was full.
    pub dropped: usize,
}

/// Hub statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    /// Number of topics with at least one subscriber.
    pub topic_count: usize,
    /// Number of registered subscribers.
    pub subscriber_count: usize,
    /// Deliveries dropped since start.
    pub dropped_total: u64,
}

/// The in-process fan-out registry.
pub struct Hub {
    topics: DashMap<Topic, HashMap<SubscriberId, SubscriberSender>>,
    next_id: AtomicU64,
    subscribers: AtomicUsize,
    dropped: AtomicU64,
    capacity: usize,
}

impl Hub {
    /// Default subscriber buffer capacity.
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Create a hub with the default subscriber capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a hub whose [`Hub::channel`] buffers `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
            subscribers: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Create a bounded subscriber channel sized for this hub.
    #[must_use]
    pub fn channel(&self) -> (SubscriberSender, SubscriberReceiver) {
        mpsc::channel(self.capacity)
    }

    /// Register a subscriber channel on a topic.
    pub fn register(&self, topic: Topic, sender: SubscriberSender) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subs = self.topics.entry(topic.clone()).or_default();
            subs.insert(id, sender);
            subs.len()
        };
        let total = self.subscribers.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_active_subscribers(total);

        debug!(topic = %topic, subscriber = id, subscribers = count, "Registered");
        Subscription { topic, id }
    }

    /// Remove a registration, dropping its channel.
    ///
    /// The topic entry goes away with its last subscriber. Returns `false` if
    /// the registration was already gone.
    pub fn unregister(&self, subscription: &Subscription) -> bool {
        let removed = match self.topics.get_mut(&subscription.topic) {
            Some(mut subs) => subs.remove(&subscription.id).is_some(),
            None => false,
        };
        if !removed {
            return false;
        }

        if self
            .topics
            .remove_if(&subscription.topic, |_, subs| subs.is_empty())
            .is_some()
        {
            debug!(topic = %subscription.topic, "Deleted empty topic");
        }

        let total = self.subscribers.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::set_active_subscribers(total);
        debug!(topic = %subscription.topic, subscriber = subscription.id, "Unregistered");
        true
    }

    /// Queue an event for every subscriber on a topic without waiting.
    pub fn broadcast(&self, topic: &Topic, event: Arc<Event>) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();

        let Some(subs) = self.topics.get(topic) else {
            trace!(topic = %topic, "Broadcast to topic without subscribers");
            return outcome;
        };

        let mut full = Vec::new();
        for (id, tx) in subs.iter() {
            match tx.try_send(Arc::clone(&event)) {
                Ok(()) => outcome.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => full.push(*id),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        drop(subs);

        if !full.is_empty() {
            outcome.dropped = full.len();
            self.dropped
                .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
            metrics::record_drops(outcome.dropped as u64);
            for id in full {
                warn!(topic = %topic, subscriber = id, "Subscriber buffer full, dropping");
            }
        }

        trace!(topic = %topic, delivered = outcome.delivered, "Broadcast");
        outcome
    }

    /// Check if a topic has subscribers.
    #[must_use]
    pub fn topic_exists(&self, topic: &Topic) -> bool {
        self.topics.contains_key(topic)
    }

    /// Get the subscriber count for a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }

    /// Deliveries dropped since start.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            topic_count: self.topics.len(),
            subscriber_count: self.subscribers.load(Ordering::Relaxed),
            dropped_total: self.dropped_count(),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::Message;

    fn event(room: &str, content: &str) -> Arc<Event> {
        Arc::new(Message::new("alice", room, content).into())
    }

    fn content(event: &Event) -> &str {
        match event {
            Event::Message(m) => &m.content,
            Event::Notification(n) => &n.content,
        }
    }

    #[test]
    fn test_topic_display_and_namespacing() {
        assert_eq!(Topic::room("r1").to_string(), "room:r1");
        assert_eq!(Topic::user("r1").to_string(), "user:r1");
        assert_ne!(Topic::room("r1"), Topic::user("r1"));
        assert_eq!(Topic::room("r1").id(), "r1");
    }

    #[test]
    fn test_topic_id_validation() {
        assert!(validate_topic_id("r1").is_ok());
        assert!(validate_topic_id("").is_err());
        assert!(validate_topic_id("has space").is_err());
        assert!(validate_topic_id(&"a".repeat(MAX_TOPIC_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_register_broadcast_unregister() {
        let hub = Hub::new();
        let topic = Topic::room("r1");

        let (tx1, mut rx1) = hub.channel();
        let (tx2, mut rx2) = hub.channel();
        let sub1 = hub.register(topic.clone(), tx1);
        let sub2 = hub.register(topic.clone(), tx2);
        assert_eq!(hub.subscriber_count(&topic), 2);

        let outcome = hub.broadcast(&topic, event("r1", "hello"));
        assert_eq!(outcome, BroadcastOutcome { delivered: 2, dropped: 0 });
        assert_eq!(content(&rx1.try_recv().unwrap()), "hello");
        assert_eq!(content(&rx2.try_recv().unwrap()), "hello");

        assert!(hub.unregister(&sub1));
        assert!(hub.topic_exists(&topic));
        assert!(hub.unregister(&sub2));
        assert!(!hub.topic_exists(&topic));
    }

    #[test]
    fn test_double_unregister_is_noop() {
        let hub = Hub::new();
        let (tx, mut rx) = hub.channel();
        let sub = hub.register(Topic::room("r1"), tx);

        assert!(hub.unregister(&sub));
        assert!(!hub.unregister(&sub));
        assert_eq!(hub.stats().subscriber_count, 0);

        // The hub held the only sender, so the channel is closed.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_full_buffer_drops_without_blocking() {
        let hub = Hub::with_capacity(1);
        let topic = Topic::room("r1");
        let (slow_tx, mut slow_rx) = hub.channel();
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        hub.register(topic.clone(), slow_tx);
        hub.register(topic.clone(), fast_tx);

        hub.broadcast(&topic, event("r1", "one"));
        let outcome = hub.broadcast(&topic, event("r1", "two"));
        assert_eq!(outcome.dropped, 1);
        assert_eq!(hub.dropped_count(), 1);

        assert_eq!(content(&slow_rx.try_recv().unwrap()), "one");
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(content(&fast_rx.try_recv().unwrap()), "one");
        assert_eq!(content(&fast_rx.try_recv().unwrap()), "two");
    }

    #[test]
    fn test_drops_counted_once_per_broadcast() {
        let hub = Hub::with_capacity(1);
        let topic = Topic::room("r1");
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = hub.channel();
            hub.register(topic.clone(), tx);
            receivers.push(rx);
        }

        hub.broadcast(&topic, event("r1", "one"));
        let outcome = hub.broadcast(&topic, event("r1", "two"));
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.dropped, 3);
        assert_eq!(hub.stats().dropped_total, 3);

        // The topic shard is free again once broadcast returns.
        let (tx, _rx) = hub.channel();
        let late = hub.register(topic.clone(), tx);
        assert!(hub.unregister(&late));
        assert_eq!(hub.subscriber_count(&topic), 3);
    }

    #[test]
    fn test_delivery_order_follows_broadcast_order() {
        let hub = Hub::with_capacity(64);
        let topic = Topic::room("r1");
        let (tx, mut rx) = hub.channel();
        hub.register(topic.clone(), tx);

        for i in 0..20 {
            hub.broadcast(&topic, event("r1", &i.to_string()));
        }
        for i in 0..20 {
            assert_eq!(content(&rx.try_recv().unwrap()), i.to_string());
        }
    }

    #[test]
    fn test_broadcast_to_unknown_topic() {
        let hub = Hub::new();
        let outcome = hub.broadcast(&Topic::user("nobody"), event("r1", "x"));
        assert_eq!(outcome, BroadcastOutcome::default());
    }

    #[test]
    fn test_stats() {
        let hub = Hub::new();
        let (tx1, _rx1) = hub.channel();
        let (tx2, _rx2) = hub.channel();
        let (tx3, _rx3) = hub.channel();
        hub.register(Topic::room("a"), tx1);
        hub.register(Topic::room("a"), tx2);
        hub.register(Topic::user("a"), tx3);

        let stats = hub.stats();
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.subscriber_count, 3);
        assert_eq!(stats.dropped_total, 0);
    }
}
