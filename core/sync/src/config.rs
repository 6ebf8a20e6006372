//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use limeaura_common::{Error, Result};

use crate::retry::RetryConfig;

/// Configuration for the sync engine, transport and scheduler.
///
/// Every field has a default, so a config file only needs the values it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL the entity collections live under.
    pub api_base_url: String,
    /// Per-request timeout enforced by the HTTP transport.
    pub request_timeout_secs: u64,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Schedule a backoff retry pass after a pass that left failed operations.
    pub retry_backoff: bool,
    /// First backoff delay.
    pub retry_initial_delay_ms: u64,
    /// Cap for the backoff delay.
    pub retry_max_delay_ms: u64,
    /// Capacity of the scheduler's trigger channel.
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:4000/api/v1".to_string(),
            request_timeout_secs: 10,
            user_agent: format!("LimeAura-Sync/{}", env!("CARGO_PKG_VERSION")),
            retry_backoff: false,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            channel_capacity: 16,
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - Invalid JSON or invalid values
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the engine unusable.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api_base_url).map_err(|e| {
            Error::InvalidInput(format!("Invalid api_base_url '{}': {}", self.api_base_url, e))
        })?;
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidInput(
                "channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Backoff parameters for scheduled retry passes.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: true,
        }
    }
}
