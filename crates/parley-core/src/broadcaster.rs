//! Topic-based fan-out of history snapshots to live subscriptions.

use crate::message::History;
use crate::subscription::{Subscription, SubscriptionInner};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Weak;
use tracing::{debug, trace};

/// Maps topic names to the set of currently-active subscriptions.
///
/// The broadcaster never owns a subscription's data: it keeps only weak
/// lookup handles, removed on deregistration and pruned on publish, so a
/// cancelled subscription cannot leak or be delivered to twice.
///
/// Publishes and registrations for a topic serialize on that topic's map
/// entry, which keeps every subscriber's delivered sequence identical and
/// lets a registration atomically seed its first value.
#[derive(Debug, Default)]
pub struct Broadcaster {
    topics: DashMap<String, HashMap<u64, Weak<SubscriptionInner>>>,
}

/// Broadcaster statistics.
#[derive(Debug, Clone)]
pub struct BroadcasterStats {
    /// Number of topics with at least one registration.
    pub topic_count: usize,
    /// Total registrations across all topics.
    pub subscription_count: usize,
}

impl Broadcaster {
    /// Create an empty broadcaster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription under its topic. Idempotent.
    pub fn register(&self, subscription: &Subscription) {
        let mut entry = self
            .topics
            .entry(subscription.topic().to_string())
            .or_default();
        entry.insert(subscription.id(), subscription.downgrade());
        debug!(
            topic = %subscription.topic(),
            id = subscription.id(),
            subscribers = entry.len(),
            "Registered subscription"
        );
    }

    /// Register a subscription and enqueue its first value in one step.
    ///
    /// `initial` is evaluated while the topic entry is held, so no
    /// concurrent publish to the topic can interleave between the
    /// registration and the seed value. The subscriber's first delivery is
    /// therefore never newer than a later one, and an append racing the
    /// registration is observed exactly once.
    pub fn register_with_initial(
        &self,
        subscription: &Subscription,
        initial: impl FnOnce() -> History,
    ) {
        let mut entry = self
            .topics
            .entry(subscription.topic().to_string())
            .or_default();
        entry.insert(subscription.id(), subscription.downgrade());
        subscription.enqueue(initial());
        debug!(
            topic = %subscription.topic(),
            id = subscription.id(),
            subscribers = entry.len(),
            "Registered subscription with initial value"
        );
    }

    /// Remove a subscription from its topic's active set. Idempotent:
    /// deregistering an already-absent subscription is a no-op.
    pub fn deregister(&self, subscription: &Subscription) {
        let topic = subscription.topic();
        let removed = match self.topics.get_mut(topic) {
            Some(mut entry) => entry.remove(&subscription.id()).is_some(),
            None => false,
        };
        if removed {
            debug!(topic = %topic, id = subscription.id(), "Deregistered subscription");
        }
        // The emptiness check and the topic removal must be a single
        // atomic step: checked separately, a registration landing between
        // them would be wiped out along with the entry.
        if self
            .topics
            .remove_if(topic, |_, set| set.is_empty())
            .is_some()
        {
            debug!(topic = %topic, "Removed empty topic");
        }
    }

    /// Deliver a value to every subscription registered under `topic` at
    /// the moment of the call. Returns the number of live subscribers the
    /// value was enqueued to.
    ///
    /// Subscriptions whose owner has gone away are pruned in passing.
    /// Publishing to a topic with no registrations is a no-op.
    pub fn publish(&self, topic: &str, value: History) -> usize {
        let Some(mut entry) = self.topics.get_mut(topic) else {
            trace!(topic = %topic, "Publish to topic with no subscribers");
            return 0;
        };

        let mut delivered = 0;
        entry.retain(|_, handle| match handle.upgrade() {
            Some(inner) => {
                inner.enqueue(History::clone(&value));
                delivered += 1;
                true
            }
            None => false,
        });
        trace!(topic = %topic, recipients = delivered, "Published update");
        delivered
    }

    /// Number of live registrations under a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|e| e.len()).unwrap_or(0)
    }

    /// Broadcaster statistics, for metrics export.
    #[must_use]
    pub fn stats(&self) -> BroadcasterStats {
        BroadcasterStats {
            topic_count: self.topics.len(),
            subscription_count: self.topics.iter().map(|e| e.len()).sum(),
        }
    }
}
