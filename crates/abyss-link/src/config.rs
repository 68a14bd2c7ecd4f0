//! Link configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_OP_TIMEOUT, DEFAULT_OTA_TIMEOUT,
    DEFAULT_RETRY_BACKOFF,
};

/// Tunables for a link session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Timeout for session operations (handshake, metadata, chunk pull), seconds.
    pub op_timeout_secs: u64,
    /// Timeout for OTA operations, seconds.
    pub ota_timeout_secs: u64,
    /// OTA chunk size in bytes; clamped to the MTU-safe range at use.
    pub chunk_size: usize,
    /// Transport-retry budget for OTA begin/transfer/end.
    pub max_retries: u32,
    /// Backoff between OTA retry attempts, milliseconds.
    pub retry_backoff_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            op_timeout_secs: DEFAULT_OP_TIMEOUT.as_secs(),
            ota_timeout_secs: DEFAULT_OTA_TIMEOUT.as_secs(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
        }
    }
}

impl LinkConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn ota_timeout(&self) -> Duration {
        Duration::from_secs(self.ota_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.op_timeout(), Duration::from_secs(10));
        assert_eq!(config.ota_timeout(), Duration::from_secs(15));
        assert_eq!(config.chunk_size, 180);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff(), Duration::from_millis(150));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = LinkConfig {
            chunk_size: 64,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: LinkConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.chunk_size, 64);
        assert_eq!(back.max_retries, config.max_retries);
    }
}
