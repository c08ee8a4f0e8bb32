//! RPC client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// RPC client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Buffer size of the client's event channel
    #[serde(rename = "channel-buffer", default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Upper bound for opening the connection, channel and queues, in milliseconds
    #[serde(rename = "connect-timeout-ms", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_channel_buffer() -> usize {
    debug!("default_channel_buffer: called");
    1024
}

fn default_connect_timeout_ms() -> u64 {
    debug!("default_connect_timeout_ms: called");
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_buffer: default_channel_buffer(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ClientConfig {
    /// Get the connect timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        debug!(connect_timeout_ms = %self.connect_timeout_ms, "ClientConfig::connect_timeout: called");
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.channel_buffer, 1024);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_connect_timeout_duration() {
        let config = ClientConfig {
            connect_timeout_ms: 2500,
            ..Default::default()
        };
        assert_eq!(config.connect_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: ClientConfig = serde_yaml::from_str("connect-timeout-ms: 500").unwrap();
        assert_eq!(config.connect_timeout_ms, 500);
        assert_eq!(config.channel_buffer, 1024);
    }
}
