//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fees::FeePolicy;

/// Configuration for a Kestrel client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the node RPC endpoint.
    pub rpc_url: String,

    /// Chain identifier used in RPC paths.
    pub chain: String,

    /// Interval between confirmation polls in milliseconds.
    pub poll_interval_ms: u64,

    /// How long an injected operation may stay unseen before waiting fails.
    pub confirmation_timeout_ms: u64,

    /// Polls spent searching for a new inclusion block after a reorg.
    pub reinclusion_ticks: u32,

    /// Consecutive failed reads tolerated while polling.
    pub max_transient_failures: u32,

    /// Upper bound on a single HTTP request to the node, in milliseconds.
    pub request_timeout_ms: u64,

    /// Default fee and limits per operation kind.
    pub fee_policy: FeePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8732".to_string(),
            chain: "main".to_string(),
            poll_interval_ms: 5_000,
            confirmation_timeout_ms: 180_000,
            reinclusion_ticks: 12,
            max_transient_failures: 5,
            request_timeout_ms: 30_000,
            fee_policy: FeePolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Configuration pointing at `rpc_url` with all other values defaulted.
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_fee_policy(mut self, policy: FeePolicy) -> Self {
        self.fee_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"rpc_url": "http://node:8732", "poll_interval_ms": 250}"#)
                .unwrap();
        assert_eq!(config.rpc_url, "http://node:8732");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.chain, "main");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.fee_policy, FeePolicy::default());
    }

    #[test]
    fn test_builders() {
        let config = ClientConfig::new("http://localhost:1")
            .with_poll_interval(Duration::from_millis(10))
            .with_confirmation_timeout(Duration::from_secs(1));
        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.confirmation_timeout_ms, 1_000);
    }
}
