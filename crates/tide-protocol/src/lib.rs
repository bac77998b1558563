//! Wire protocol for Tide.
//!
//! Defines the framing, message types, and serialization format used between
//! Tide clients and the storage server: handshake, the two-phase commit
//! calls, loads, resync, and the unsolicited invalidation push.

pub mod auth;
pub mod codec;
pub mod error;
pub mod message;

pub use auth::Credentials;
pub use codec::TideCodec;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    ErrorCode, Frame, Message, ServerStatus, MAX_HANDSHAKE_SIZE, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION, PUSH_REQUEST_ID,
};
