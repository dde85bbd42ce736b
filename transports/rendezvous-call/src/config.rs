//! Configuration types for the rendezvous call client

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Main configuration for SignalingClient
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Rendezvous server WebSocket URL (ws:// or wss://)
    pub signaling_url: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// Query parameter carrying the local identifier on connect (default: "id")
    pub id_query_param: String,

    /// Control channel reconnection policy
    pub reconnect: ReconnectPolicy,

    /// Buffer size of the notice stream (default: 64)
    pub notice_capacity: usize,
}

/// Reconnection policy for the rendezvous link
///
/// The delay between attempts is fixed; there is no backoff growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts (default: 5)
    pub max_attempts: u32,

    /// Delay before each attempt in milliseconds (default: 2000ms)
    pub delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 2000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before the next attempt
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Check if another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080/ws".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            id_query_param: "id".to_string(),
            reconnect: ReconnectPolicy::default(),
            notice_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Create a config for the given rendezvous URL with all other fields defaulted
    pub fn with_signaling_url(url: impl Into<String>) -> Self {
        Self {
            signaling_url: url.into(),
            ..Default::default()
        }
    }

    /// Parse a config from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a valid ws:// or wss:// URL
    /// - `stun_servers` is empty or holds a non-STUN URL
    /// - `id_query_param` is empty
    /// - `reconnect.max_attempts` is zero
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.signaling_url).map_err(|e| {
            Error::InvalidConfig(format!(
                "signaling_url is not a valid URL ({}): {}",
                self.signaling_url, e
            ))
        })?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }
        if let Some(bad) = self
            .stun_servers
            .iter()
            .find(|s| !s.starts_with("stun:") && !s.starts_with("stuns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "stun_servers entries must start with stun: or stuns:, got {}",
                bad
            )));
        }

        if self.id_query_param.is_empty() {
            return Err(Error::InvalidConfig(
                "id_query_param must not be empty".to_string(),
            ));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Control channel endpoint for `self_id`
    ///
    /// The identifier is appended as a query parameter; the rendezvous server
    /// routes `to`-addressed frames to the channel registered under it.
    pub fn signaling_endpoint(&self, self_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.signaling_url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid signaling_url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair(&self.id_query_param, self_id);
        Ok(url)
    }
}
