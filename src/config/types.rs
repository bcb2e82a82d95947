//! Configuration data model.
//!
//! Struct definitions plus defaults only; source resolution and validation
//! live in `config::mod`.

use serde::Deserialize;
use std::time::Duration;

use super::defaults::{
    DEFAULT_BASE_URL, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_FINALIZE_ATTEMPTS,
    DEFAULT_FINALIZE_BACKOFF_MS, DEFAULT_HISTORY_PATH, DEFAULT_SESSION_DIR, DEFAULT_STREAM_PATH,
    DEFAULT_TIMEOUT_SECS,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub sessions: SessionsConfig,
    pub display: DisplayConfig,
}

/// Where the server lives and how to reach it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    /// Optional bearer token attached to every request.
    pub api_token: Option<String>,
    /// Timeout for non-streaming requests.
    pub timeout_secs: u64,
    pub stream_path: String,
    /// Must contain a `{thread_id}` placeholder.
    pub history_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            history_path: DEFAULT_HISTORY_PATH.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Streaming run behavior.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    pub connect_timeout_secs: u64,
    /// Total attempts of the post-`end` history refresh.
    pub finalize_attempts: u32,
    pub finalize_backoff_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            finalize_attempts: DEFAULT_FINALIZE_ATTEMPTS,
            finalize_backoff_ms: DEFAULT_FINALIZE_BACKOFF_MS,
        }
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn finalize_backoff(&self) -> Duration {
        Duration::from_millis(self.finalize_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionsConfig {
    pub dir: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dir: DEFAULT_SESSION_DIR.to_string(),
        }
    }
}

/// Terminal rendering options.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayConfig {
    pub color: bool,
    pub show_tool_calls: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            color: true,
            show_tool_calls: true,
        }
    }
}
