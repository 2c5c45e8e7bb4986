//! The chat message entity.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// A single posted chat message.
///
/// Messages are immutable once created: the log only ever appends them,
/// never mutates or removes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique message identifier.
    pub id: Uuid,
    /// Name of the user who posted the message.
    pub user: String,
    /// Message body.
    pub content: String,
}

/// A point-in-time copy of the full message history.
///
/// Shared behind an `Arc` so fanning one snapshot out to N subscribers
/// does not clone the history N times.
pub type History = Arc<Vec<Message>>;

impl Message {
    /// Create a new message with a freshly generated id.
    ///
    /// Ids are random v4 UUIDs, so concurrent appends cannot collide.
    #[must_use]
    pub fn new(user: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user: user.into(),
            content: content.into(),
        }
    }
}
