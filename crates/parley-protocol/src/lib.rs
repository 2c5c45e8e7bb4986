//! # parley-protocol
//!
//! Wire protocol for the Parley chat backend.
//!
//! Defines the frames exchanged between clients and the server over a
//! persistent duplex connection, and the codec that puts them on the
//! wire (MessagePack with a length prefix).
//!
//! ## Frame kinds
//!
//! - `Init` / `Ack` - Handshake
//! - `Start` - Begin a read / append / subscribe operation under an id
//! - `Next` / `Error` / `Complete` - Per-operation results and lifecycle
//! - `Ping` / `Pong` - Keep-alive
//! - `Close` - Session termination
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Frame, Operation};
//!
//! let frame = Frame::start("op-1", Operation::Subscribe);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType, Operation, Payload};
pub use version::{is_supported, PROTOCOL_VERSION};
