//! # parley-core
//!
//! Real-time publish/subscribe delivery engine for the Parley chat
//! backend.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **MessageLog** - Append-only in-memory chat history
//! - **Broadcaster** - Topic-based fan-out to live subscriptions
//! - **Subscription** - Bounded drop-oldest delivery queue per subscriber
//! - **OperationDispatcher** - Resolves append / read / subscribe
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────────┐     ┌─────────────┐
//! │   Session   │────▶│ OperationDispatcher │────▶│  MessageLog │
//! └─────────────┘     └─────────────────────┘     └─────────────┘
//!                                │
//!                                ▼
//!                        ┌─────────────┐     ┌──────────────┐
//!                        │ Broadcaster │────▶│ Subscription │
//!                        └─────────────┘     └──────────────┘
//! ```
//!
//! Every append republishes the full updated history to each subscriber;
//! a slow subscriber's queue drops its oldest pending update rather than
//! blocking the publisher, so everyone converges on the latest state.

pub mod broadcaster;
pub mod dispatcher;
pub mod log;
pub mod message;
pub mod subscription;

pub use broadcaster::{Broadcaster, BroadcasterStats};
pub use dispatcher::{DispatchError, OperationDispatcher, MESSAGES_TOPIC};
pub use log::MessageLog;
pub use message::{History, Message};
pub use subscription::{Subscription, DEFAULT_QUEUE_CAPACITY};
