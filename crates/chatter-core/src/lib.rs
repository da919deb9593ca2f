//! Core session contract shared between the realtime driver and consumers.
//!
//! This crate defines the wire frame codec, the session lifecycle state
//! machine, the reconnection policy, and the common error/channel
//! abstractions. Everything here is transport-free and synchronous so the
//! whole lifecycle is unit-testable without sockets.

/// Async command/event channel primitives.
pub mod channel;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Wire frame codec for the realtime connection.
pub mod frame;
/// Backoff policy used when re-establishing dropped connections.
pub mod reconnect;
/// Session lifecycle state machine.
pub mod session;
/// Session-facing protocol types (commands, events, payloads).
pub mod types;

pub use channel::{EventStream, SessionChannelError, SessionChannels};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use frame::{InboundFrame, OutboundFrame, decode_frame, encode_frame};
pub use reconnect::ReconnectPolicy;
pub use session::{Effect, Generation, SessionMachine, TransportClose};
pub use types::{
    ChatMessage, ConnectionState, SessionCommand, SessionDescriptor, SessionEvent, UserId,
};
