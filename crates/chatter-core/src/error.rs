use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization rejection.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited or timed out by the backend.
    RateLimited,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the session event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ChatError {
    /// Construct a new error payload.
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is in state {current:?}"),
        )
    }

    /// Build the authentication-rejected error from an optional server reason.
    pub fn auth_rejected(reason: Option<String>) -> Self {
        Self::new(
            ChatErrorCategory::Auth,
            "authentication_rejected",
            reason.unwrap_or_else(|| "authentication failed".to_owned()),
        )
    }

    /// Build the terminal error raised once automatic reconnection gives up.
    pub fn reconnect_exhausted(max_attempts: u32) -> Self {
        Self::new(
            ChatErrorCategory::Network,
            "reconnect_exhausted",
            format!(
                "could not reconnect to the chat server after {max_attempts} attempts; manual reconnect required"
            ),
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ChatErrorCategory {
    match status {
        401 | 403 => ChatErrorCategory::Auth,
        408 | 429 => ChatErrorCategory::RateLimited,
        400..=499 => ChatErrorCategory::Config,
        500..=599 => ChatErrorCategory::Network,
        _ => ChatErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), ChatErrorCategory::Auth);
        assert_eq!(classify_http_status(429), ChatErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), ChatErrorCategory::Config);
        assert_eq!(classify_http_status(503), ChatErrorCategory::Network);
        assert_eq!(classify_http_status(700), ChatErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = ChatError::invalid_state(ConnectionState::Idle, "send_message");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, ChatErrorCategory::Internal);
    }

    #[test]
    fn auth_rejection_falls_back_to_generic_message() {
        let err = ChatError::auth_rejected(None);
        assert_eq!(err.message, "authentication failed");

        let err = ChatError::auth_rejected(Some("token expired".to_owned()));
        assert_eq!(err.message, "token expired");
        assert_eq!(err.category, ChatErrorCategory::Auth);
    }
}
