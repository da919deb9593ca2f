use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ChatError;

/// Backend user identifier.
pub type UserId = u64;

/// One logical conversation binding: local user, counterpart, credential.
///
/// A descriptor identifies a session for its whole lifetime, across any
/// number of underlying connection attempts. Changing the counterpart means
/// a brand-new session, never a mutation of an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// Local (authenticated) user ID.
    pub local_user_id: UserId,
    /// Counterpart user ID the conversation is bound to.
    pub counterpart_id: UserId,
    /// Opaque bearer token obtained from the credential exchange.
    pub token: String,
}

impl SessionDescriptor {
    pub fn new(local_user_id: UserId, counterpart_id: UserId, token: impl Into<String>) -> Self {
        Self {
            local_user_id,
            counterpart_id,
            token: token.into(),
        }
    }
}

/// Connection lifecycle state of one session.
///
/// Exactly one state is active per session at any time; transitions are
/// driven by the session machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// Session exists but no connection attempt has started.
    Idle,
    /// A transport connection attempt is in flight.
    Connecting,
    /// Transport is open; waiting for the authentication-result frame.
    Authenticating,
    /// Authenticated and ready to exchange chat frames.
    Open,
    /// Waiting out the backoff delay before the next connection attempt.
    Reconnecting,
    /// Terminal failure: auth rejection or exhausted reconnection.
    Failed,
    /// Terminal clean shutdown requested by the caller or the server.
    Closed,
}

impl ConnectionState {
    /// Whether the session can never leave this state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// A single display-ready chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// Sender user ID.
    pub sender: UserId,
    /// Message body.
    pub body: String,
    /// Timestamp in milliseconds since the Unix epoch.
    ///
    /// Assigned client-side on receipt; the wire frame may omit one.
    pub timestamp_ms: u64,
}

/// Command channel input accepted by the session driver.
#[derive(Debug)]
pub enum SessionCommand {
    /// Send a chat message to the session counterpart.
    ///
    /// Replies `true` only when the session was Open and an envelope was
    /// handed to the transport. Rejection is a reply of `false`, never an
    /// error.
    SendMessage {
        /// Raw user-composed text.
        text: String,
        /// Synchronous success indicator back to the caller.
        reply: oneshot::Sender<bool>,
    },
    /// Close the session cleanly and cancel any pending reconnect.
    Close,
}

/// Event channel output emitted by the session driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session reached Open: connected and authenticated.
    Connected,
    /// An inbound chat message was classified and accepted.
    Message(ChatMessage),
    /// The connection dropped abnormally; a reconnect is scheduled.
    ConnectivityLost {
        /// Reconnect attempt number about to be made, counted from 1.
        attempt: u32,
        /// Configured attempt cap.
        max_attempts: u32,
        /// Backoff delay before the attempt, in milliseconds.
        retry_in_ms: u64,
    },
    /// An error surfaced to the caller.
    ///
    /// `terminal` marks errors that end the session (auth rejection,
    /// exhausted reconnection); everything else is informational.
    Error {
        /// Error payload.
        error: ChatError,
        /// Whether the session is over.
        terminal: bool,
    },
    /// Session reached Closed.
    Closed,
}
