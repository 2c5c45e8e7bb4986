//! Append-only in-memory message history.
//!
//! The log is the single source of truth for chat history. It lives for
//! the lifetime of the process and is discarded on exit; there is no
//! persistence.

use crate::message::Message;
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// Ordered, append-only store of posted messages.
///
/// The sequence only ever grows: no reordering, no removal. Constructed
/// once at startup and injected into the dispatcher rather than accessed
/// as ambient global state.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Mutex<Vec<Message>>,
}

impl MessageLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return it.
    pub fn append(&self, user: impl Into<String>, content: impl Into<String>) -> Message {
        let message = Message::new(user, content);
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        messages.push(message.clone());
        trace!(id = %message.id, total = messages.len(), "Appended message");
        message
    }

    /// Append a message and snapshot the history in one lock acquisition.
    ///
    /// The returned snapshot always contains the new message, so a reader
    /// can never observe an append as successful while a snapshot taken
    /// for its publish omits it.
    pub fn append_and_snapshot(
        &self,
        user: impl Into<String>,
        content: impl Into<String>,
    ) -> (Message, Vec<Message>) {
        let message = Message::new(user, content);
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        messages.push(message.clone());
        trace!(id = %message.id, total = messages.len(), "Appended message");
        (message, messages.clone())
    }

    /// Snapshot the full history at a single point in time.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of messages in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
