//! Request/response collaborators of the realtime core: credential exchange,
//! contact and history reads, and durable message persistence.
//!
//! Everything here is stateless per call; the session layer never blocks on
//! these operations.

use reqwest::{Response, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use chatter_core::{ChatErrorCategory, UserId, classify_http_status};

/// Errors produced by API calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The backend answered with a non-success status.
    #[error("request rejected ({status}): {detail}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error category mapped from the status.
        category: ChatErrorCategory,
        /// Server-supplied `detail` string when present.
        detail: String,
    },
}

/// Authenticated user profile record.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
}

/// Credential exchange result: opaque bearer token plus profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub token: String,
    pub user: UserProfile,
}

/// One durably stored chat message, as returned by the history read.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: u64,
    pub sender: UserId,
    pub receiver: UserId,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct CredentialsRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    sender: UserId,
    receiver: UserId,
    message: &'a str,
}

/// HTTP client for the chat backend's request/response surface.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Two-step credential exchange: obtain a token, then the profile it
    /// belongs to.
    pub async fn login(&self, username: &str, password: &str) -> Result<AuthSession, ApiError> {
        debug!(username, "requesting bearer token");
        let response = self
            .http
            .post(endpoint(&self.base_url, "api/token/"))
            .json(&CredentialsRequest { username, password })
            .send()
            .await?;
        let token = check(response).await?.json::<TokenResponse>().await?.token;

        let response = self
            .http
            .post(endpoint(&self.base_url, "api/login/"))
            .header(AUTHORIZATION, format!("Token {token}"))
            .send()
            .await?;
        let user = check(response).await?.json::<UserProfile>().await?;

        Ok(AuthSession { token, user })
    }

    /// Contact list visible to the token's user.
    pub async fn contacts(&self, token: &str) -> Result<Vec<UserProfile>, ApiError> {
        let response = self
            .http
            .get(endpoint(&self.base_url, "api/users/"))
            .header(AUTHORIZATION, format!("Token {token}"))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Ordered message history with one counterpart.
    pub async fn history(
        &self,
        token: &str,
        counterpart_id: UserId,
    ) -> Result<Vec<StoredMessage>, ApiError> {
        let response = self
            .http
            .get(endpoint(
                &self.base_url,
                &format!("api/messages/{counterpart_id}/"),
            ))
            .header(AUTHORIZATION, format!("Token {token}"))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Durably store one sent message.
    ///
    /// Callers treat this as fire-and-forget; sending never waits on it.
    pub async fn save_message(
        &self,
        token: &str,
        sender: UserId,
        receiver: UserId,
        message: &str,
    ) -> Result<(), ApiError> {
        let response = self
            .http
            .post(endpoint(&self.base_url, "api/messages/create/"))
            .header(AUTHORIZATION, format!("Token {token}"))
            .json(&CreateMessageRequest {
                sender,
                receiver,
                message,
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

fn endpoint(base: &Url, path: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), path)
}

/// Turn a non-success response into [`ApiError::Rejected`], keeping the
/// server's `detail` string when it sent one.
async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let status = status.as_u16();
    let detail = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|body| body.detail)
        .unwrap_or_else(|| format!("request rejected with status {status}"));

    Err(ApiError::Rejected {
        status,
        category: classify_http_status(status),
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_endpoints_without_duplicate_slashes() {
        let base = Url::parse("http://localhost:8000/").expect("valid url");
        assert_eq!(
            endpoint(&base, "api/token/"),
            "http://localhost:8000/api/token/"
        );

        let base = Url::parse("https://api.example.org/backend").expect("valid url");
        assert_eq!(
            endpoint(&base, "api/messages/7/"),
            "https://api.example.org/backend/api/messages/7/"
        );
    }

    #[test]
    fn deserializes_backend_records() {
        let profile: UserProfile =
            serde_json::from_str(r#"{"id":3,"username":"ana"}"#).expect("profile should decode");
        assert_eq!(
            profile,
            UserProfile {
                id: 3,
                username: "ana".to_owned(),
            }
        );

        let stored: StoredMessage = serde_json::from_str(
            r#"{"id":11,"sender":1,"receiver":3,"message":"hi","timestamp":"2026-01-04T10:00:00Z"}"#,
        )
        .expect("stored message should decode");
        assert_eq!(stored.sender, 1);
        assert_eq!(stored.message, "hi");

        let token: TokenResponse =
            serde_json::from_str(r#"{"token":"abc123"}"#).expect("token should decode");
        assert_eq!(token.token, "abc123");
    }

    #[test]
    fn serializes_request_payloads() {
        let json = serde_json::to_value(CredentialsRequest {
            username: "ana",
            password: "pw",
        })
        .expect("credentials serialize");
        assert_eq!(json["username"], "ana");

        let json = serde_json::to_value(CreateMessageRequest {
            sender: 1,
            receiver: 3,
            message: "hi",
        })
        .expect("create-message serialize");
        assert_eq!(json["receiver"], 3);
        assert_eq!(json["message"], "hi");
    }

    #[test]
    fn rejection_keeps_status_category() {
        let err = ApiError::Rejected {
            status: 401,
            category: classify_http_status(401),
            detail: "Invalid credentials".to_owned(),
        };
        match err {
            ApiError::Rejected {
                category, detail, ..
            } => {
                assert_eq!(category, ChatErrorCategory::Auth);
                assert_eq!(detail, "Invalid credentials");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
