use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatErrorCategory};
use crate::types::UserId;

/// Wire value of a successful authentication result.
const AUTH_STATUS_SUCCESS: &str = "success";

/// Inbound frame tagged by `kind`.
///
/// Unrecognized tags decode to [`InboundFrame::Unknown`] instead of failing,
/// so newer server frame types never break an established session.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InboundFrame {
    /// Server reply to the post-connect authentication frame.
    AuthenticationResult {
        /// `"success"` or a rejection status.
        status: String,
        /// Optional server-supplied reason on rejection.
        #[serde(default)]
        message: Option<String>,
    },
    /// A chat message from the counterpart.
    ChatMessage {
        /// Sender user ID.
        sender: UserId,
        /// Message body.
        message: String,
        /// Server timestamp when present; assigned client-side otherwise.
        #[serde(default)]
        timestamp_ms: Option<u64>,
    },
    /// Any frame kind this client does not recognize.
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    /// Whether an authentication-result frame reports success.
    pub fn auth_succeeded(status: &str) -> bool {
        status == AUTH_STATUS_SUCCESS
    }
}

/// Outbound frame constructed by the session machine.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OutboundFrame {
    /// Post-connect credential frame (authentication variant with an
    /// explicit handshake on top of the URL credential).
    Authentication {
        /// Bearer token for this session.
        token: String,
    },
    /// User-composed chat message envelope.
    ChatMessage {
        /// Message body.
        message: String,
        /// Counterpart the message is addressed to.
        receiver_id: UserId,
    },
}

/// Decode one inbound frame from its JSON text.
pub fn decode_frame(text: &str) -> Result<InboundFrame, ChatError> {
    serde_json::from_str(text).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "frame_decode_failed",
            err.to_string(),
        )
    })
}

/// Encode one outbound frame to JSON text.
pub fn encode_frame(frame: &OutboundFrame) -> Result<String, ChatError> {
    serde_json::to_string(frame).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "frame_encode_failed",
            err.to_string(),
        )
    })
}
