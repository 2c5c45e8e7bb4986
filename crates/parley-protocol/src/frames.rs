//! Frame types for the Parley connection protocol.
//!
//! A connection exchanges frames over one duplex channel: a handshake
//! (`init`/`ack`), then client-initiated operations multiplexed by a
//! client-chosen operation id, plus keep-alive and session close.

use parley_core::Message;
use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Init = 0x01,
    Ack = 0x02,
    Start = 0x03,
    Next = 0x04,
    Error = 0x05,
    Complete = 0x06,
    Ping = 0x07,
    Pong = 0x08,
    Close = 0x09,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Init),
            0x02 => Ok(FrameType::Ack),
            0x03 => Ok(FrameType::Start),
            0x04 => Ok(FrameType::Next),
            0x05 => Ok(FrameType::Error),
            0x06 => Ok(FrameType::Complete),
            0x07 => Ok(FrameType::Ping),
            0x08 => Ok(FrameType::Pong),
            0x09 => Ok(FrameType::Close),
            _ => Err("Invalid frame type"),
        }
    }
}

/// An operation a client starts under an operation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Operation {
    /// Fetch the full message history.
    #[serde(rename = "read")]
    Read,

    /// Post a message.
    #[serde(rename = "append")]
    Append {
        /// Posting user. Must be non-empty.
        user: String,
        /// Message body. Must be non-empty.
        content: String,
    },

    /// Open a live stream of history updates.
    #[serde(rename = "subscribe")]
    Subscribe,
}

/// Result payload carried by a `next` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Payload {
    /// Id of a freshly appended message.
    #[serde(rename = "message_id")]
    MessageId {
        /// The new message's id, as its canonical string form.
        id: String,
    },

    /// A full history snapshot.
    #[serde(rename = "history")]
    History {
        /// Every message posted so far, in append order.
        messages: Vec<Message>,
    },
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Start the handshake (client to server).
    #[serde(rename = "init")]
    Init {
        /// Protocol version the client speaks.
        version: u8,
    },

    /// Handshake accepted (server to client).
    #[serde(rename = "ack")]
    Ack {
        /// Unique session identifier.
        session_id: String,
        /// Recommended keep-alive interval in milliseconds.
        heartbeat_ms: u32,
    },

    /// Begin an operation under a client-chosen id.
    #[serde(rename = "start")]
    Start {
        /// Operation id, unique among the client's in-flight operations.
        id: String,
        /// The operation to perform.
        operation: Operation,
    },

    /// One delivered result or update for an operation.
    #[serde(rename = "next")]
    Next {
        /// Id of the operation this result belongs to.
        id: String,
        /// The result payload.
        payload: Payload,
    },

    /// Operation-scoped failure; the session stays open.
    #[serde(rename = "error")]
    Error {
        /// Id of the failed operation.
        id: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Operation finished: the client cancels it, or the server signals
    /// a one-shot operation complete.
    #[serde(rename = "complete")]
    Complete {
        /// Id of the finished operation.
        id: String,
    },

    /// Keep-alive ping (either direction).
    #[serde(rename = "ping")]
    Ping,

    /// Keep-alive pong (either direction).
    #[serde(rename = "pong")]
    Pong,

    /// Terminate the session (either direction).
    #[serde(rename = "close")]
    Close {
        /// Why the session is closing.
        reason: String,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Init { .. } => FrameType::Init,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Start { .. } => FrameType::Start,
            Frame::Next { .. } => FrameType::Next,
            Frame::Error { .. } => FrameType::Error,
            Frame::Complete { .. } => FrameType::Complete,
            Frame::Ping => FrameType::Ping,
            Frame::Pong => FrameType::Pong,
            Frame::Close { .. } => FrameType::Close,
        }
    }

    /// Create a new Init frame.
    #[must_use]
    pub fn init(version: u8) -> Self {
        Frame::Init { version }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(session_id: impl Into<String>, heartbeat_ms: u32) -> Self {
        Frame::Ack {
            session_id: session_id.into(),
            heartbeat_ms,
        }
    }

    /// Create a new Start frame.
    #[must_use]
    pub fn start(id: impl Into<String>, operation: Operation) -> Self {
        Frame::Start {
            id: id.into(),
            operation,
        }
    }

    /// Create a Next frame carrying a history snapshot.
    #[must_use]
    pub fn next_history(id: impl Into<String>, messages: Vec<Message>) -> Self {
        Frame::Next {
            id: id.into(),
            payload: Payload::History { messages },
        }
    }

    /// Create a Next frame carrying a new message id.
    #[must_use]
    pub fn next_message_id(id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Frame::Next {
            id: id.into(),
            payload: Payload::MessageId {
                id: message_id.into(),
            },
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Frame::Error {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Complete frame.
    #[must_use]
    pub fn complete(id: impl Into<String>) -> Self {
        Frame::Complete { id: id.into() }
    }

    /// Create a new Close frame.
    #[must_use]
    pub fn close(reason: impl Into<String>) -> Self {
        Frame::Close {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let start = Frame::start("op-1", Operation::Read);
        assert_eq!(start.frame_type(), FrameType::Start);

        let next = Frame::next_history("op-1", vec![]);
        assert_eq!(next.frame_type(), FrameType::Next);

        assert_eq!(Frame::Ping.frame_type(), FrameType::Ping);
    }

    #[test]
    fn test_frame_type_conversion() {
        for byte in 0x01..=0x09u8 {
            let ft = FrameType::try_from(byte).unwrap();
            assert_eq!(u8::from(ft), byte);
        }
        assert!(FrameType::try_from(0x0A).is_err());
        assert!(FrameType::try_from(0).is_err());
    }

    #[test]
    fn test_constructors() {
        let frame = Frame::start(
            "op-7",
            Operation::Append {
                user: "alice".into(),
                content: "hi".into(),
            },
        );
        match frame {
            Frame::Start { id, operation } => {
                assert_eq!(id, "op-7");
                assert!(matches!(operation, Operation::Append { .. }));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
