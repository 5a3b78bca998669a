//! Sandbox configuration.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Environment variable holding the listen address.
pub const BIND_VAR: &str = "KESTREL_SANDBOX_BIND";

/// Environment variable holding the bake interval in milliseconds.
pub const BAKE_INTERVAL_VAR: &str = "KESTREL_BAKE_INTERVAL_MS";

/// Runtime configuration for the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Address the RPC server listens on.
    pub bind: SocketAddr,

    /// Interval between baked blocks. Zero disables the baker; blocks are
    /// then only baked through `/sandbox/bake`.
    pub bake_interval_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8732)),
            bake_interval_ms: 2_000,
        }
    }
}

impl SandboxConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(bind) = lookup(BIND_VAR) {
            config.bind = bind
                .parse()
                .with_context(|| format!("{BIND_VAR} is not a socket address: {bind}"))?;
        }
        if let Some(interval) = lookup(BAKE_INTERVAL_VAR) {
            config.bake_interval_ms = interval
                .parse()
                .with_context(|| format!("{BAKE_INTERVAL_VAR} is not a number: {interval}"))?;
        }
        Ok(config)
    }

    /// Bake interval, `None` when baking is manual.
    pub fn bake_interval(&self) -> Option<Duration> {
        (self.bake_interval_ms > 0).then(|| Duration::from_millis(self.bake_interval_ms))
    }
}
