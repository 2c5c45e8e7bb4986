//! Resolution of client operations against the log and broadcaster.

use crate::broadcaster::Broadcaster;
use crate::log::MessageLog;
use crate::message::{History, Message};
use crate::subscription::{Subscription, DEFAULT_QUEUE_CAPACITY};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// The single topic carrying every posted message.
///
/// The design generalizes to many topics; this deployment uses one.
pub const MESSAGES_TOPIC: &str = "messages";

/// Operation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Malformed operation input. Scoped to the offending operation; the
    /// caller's session stays open.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Translates append / read / subscribe operations into calls on the
/// [`MessageLog`] and [`Broadcaster`].
///
/// Stateless between calls; all state lives in the injected collaborators.
pub struct OperationDispatcher {
    log: Arc<MessageLog>,
    broadcaster: Arc<Broadcaster>,
    queue_capacity: usize,
    /// Serializes the append-and-publish pair: snapshots must reach the
    /// broadcaster in log order, or a subscriber could observe the
    /// history shrink under concurrent appends.
    publish_order: Mutex<()>,
}

impl OperationDispatcher {
    /// Create a dispatcher over a log and broadcaster.
    #[must_use]
    pub fn new(log: Arc<MessageLog>, broadcaster: Arc<Broadcaster>) -> Self {
        Self::with_queue_capacity(log, broadcaster, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a dispatcher with a specific delivery queue capacity for
    /// the subscriptions it hands out.
    #[must_use]
    pub fn with_queue_capacity(
        log: Arc<MessageLog>,
        broadcaster: Arc<Broadcaster>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            log,
            broadcaster,
            queue_capacity,
            publish_order: Mutex::new(()),
        }
    }

    /// Current full history. No side effects.
    #[must_use]
    pub fn read(&self) -> Vec<Message> {
        self.log.snapshot()
    }

    /// Append a message and publish the updated history to every
    /// subscriber of the messages topic. Returns the new message's id.
    ///
    /// Concurrent appends publish their snapshots in log order, so a
    /// subscriber's delivered histories only ever grow.
    ///
    /// The published payload is the full updated history, not a delta;
    /// this mirrors the service contract the engine replaces and is
    /// isolated behind [`Broadcaster::publish`] so an incremental design
    /// stays a local change.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidArgument`] if `user` or `content`
    /// is empty; nothing is appended or published in that case.
    pub fn append(&self, user: &str, content: &str) -> Result<Uuid, DispatchError> {
        if user.is_empty() {
            return Err(DispatchError::InvalidArgument("user must not be empty"));
        }
        if content.is_empty() {
            return Err(DispatchError::InvalidArgument("content must not be empty"));
        }

        let (message, delivered) = {
            let _order = self
                .publish_order
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let (message, snapshot) = self.log.append_and_snapshot(user, content);
            let delivered = self
                .broadcaster
                .publish(MESSAGES_TOPIC, History::new(snapshot));
            (message, delivered)
        };
        debug!(id = %message.id, user = %message.user, recipients = delivered, "Appended message");
        Ok(message.id)
    }

    /// Create and register a live subscription on the messages topic.
    ///
    /// The subscription's first delivered value is the history at the
    /// moment of registration (possibly empty), so a new subscriber sees
    /// history-to-date without waiting for the next append.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let subscription = Subscription::new(MESSAGES_TOPIC, self.queue_capacity);
        self.broadcaster
            .register_with_initial(&subscription, || History::new(self.log.snapshot()));
        debug!(id = subscription.id(), "Created subscription");
        subscription
    }

    /// Cancel a subscription and remove it from the broadcaster.
    ///
    /// Deregistration is synchronous: once this returns, no further
    /// publish targets the subscription.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.cancel();
        self.broadcaster.deregister(subscription);
    }

    /// The broadcaster this dispatcher publishes through.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// The log this dispatcher reads and appends.
    #[must_use]
    pub fn log(&self) -> &MessageLog {
        &self.log
    }
}
