//! Live subscriptions and their delivery queues.
//!
//! A subscription is one subscriber's registration on a topic. It owns a
//! bounded delivery queue with a drop-oldest policy, so a slow consumer
//! never blocks the publisher and always converges on the latest value.

use crate::message::History;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::Notify;
use tracing::trace;

/// Default delivery queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Counter handing out subscription ids for registry bookkeeping.
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(0);

/// Shared state between a [`Subscription`] and the broadcaster's weak
/// handle to it.
#[derive(Debug)]
pub(crate) struct SubscriptionInner {
    topic: String,
    queue: Mutex<VecDeque<History>>,
    capacity: usize,
    notify: Notify,
    cancelled: AtomicBool,
}

impl SubscriptionInner {
    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    /// Push a value onto the queue, dropping the oldest entry if full.
    ///
    /// Never blocks. A no-op after cancellation.
    pub(crate) fn enqueue(&self, value: History) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() == self.capacity {
                // Last value wins: liveness over completeness.
                queue.pop_front();
                trace!(topic = %self.topic, "Dropped oldest queued update");
            }
            queue.push_back(value);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<History> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// A live registration on a topic.
///
/// Owned by exactly one connection session; the broadcaster only holds a
/// weak lookup handle. `next()` is intended for a single consumer, the
/// owning session's delivery loop.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Create a new subscription on a topic.
    #[must_use]
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(SubscriptionInner {
                topic: topic.into(),
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify: Notify::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Registry id, unique per subscription for the process lifetime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The topic this subscription is attached to.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.inner.topic()
    }

    /// Push a value onto the delivery queue (drop-oldest when full).
    pub fn enqueue(&self, value: History) {
        self.inner.enqueue(value);
    }

    /// Wait for the next delivered value.
    ///
    /// Returns `None` once the subscription has been cancelled and the
    /// queue is empty. A pending call is woken by [`cancel`](Self::cancel).
    pub async fn next(&self) -> Option<History> {
        loop {
            // Register interest before checking the queue so an enqueue
            // between the check and the await is not missed.
            let notified = self.inner.notify.notified();
            if self.inner.cancelled.load(Ordering::Acquire) {
                return None;
            }
            if let Some(value) = self.inner.pop() {
                return Some(value);
            }
            notified.await;
        }
    }

    /// Cancel the subscription. Idempotent.
    ///
    /// Wakes any pending [`next`](Self::next), which then reports
    /// termination. Values already queued are discarded.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner.notify.notify_one();
        trace!(topic = %self.inner.topic, id = self.id, "Subscription cancelled");
    }

    /// Check whether the subscription has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Number of values currently queued.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn downgrade(&self) -> Weak<SubscriptionInner> {
        Arc::downgrade(&self.inner)
    }
}
