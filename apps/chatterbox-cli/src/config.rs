//! Environment-backed runtime configuration for `chatterbox-cli`.

use std::env;

use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_WS_URL: &str = "ws://localhost:8000";
const DEFAULT_LOG_MAX_ITEMS: usize = 1_000;

/// Runtime configuration used by the console client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    /// Base URL of the request/response backend.
    pub api_base: Url,
    /// Base URL of the realtime endpoint.
    pub ws_base: Url,
    /// Login username.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Display log cap for in-memory message retention.
    pub log_max_items: usize,
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl CliConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_base = parse_url("CHATTERBOX_API_URL", DEFAULT_API_URL, &mut lookup)?;
        let ws_base = parse_url("CHATTERBOX_WS_URL", DEFAULT_WS_URL, &mut lookup)?;
        let username = required("CHATTERBOX_USER", &mut lookup)?;
        let password = required("CHATTERBOX_PASSWORD", &mut lookup)?;
        let log_max_items =
            parse_usize("CHATTERBOX_LOG_MAX_ITEMS", DEFAULT_LOG_MAX_ITEMS, &mut lookup)?;

        if log_max_items == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHATTERBOX_LOG_MAX_ITEMS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            api_base,
            ws_base,
            username,
            password,
            log_max_items,
        })
    }
}

fn optional_trimmed<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed(key, lookup).ok_or(ConfigError::Missing(key))
}

fn parse_url<F>(key: &'static str, default: &str, lookup: &mut F) -> Result<Url, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let raw = optional_trimmed(key, lookup).unwrap_or_else(|| default.to_owned());
    Url::parse(&raw).map_err(|err| ConfigError::InvalidValue {
        key,
        value: raw,
        reason: err.to_string(),
    })
}

fn parse_usize<F>(key: &'static str, default: usize, lookup: &mut F) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    match optional_trimmed(key, lookup) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: raw,
            reason: "must be an unsigned integer".to_owned(),
        }),
    }
}
