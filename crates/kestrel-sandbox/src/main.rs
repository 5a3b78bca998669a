//! # Kestrel Sandbox
//!
//! Local node for developing against the Kestrel client.

use kestrel_sandbox::SandboxConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SandboxConfig::from_env()?;
    info!(bind = %config.bind, "Kestrel sandbox starting");

    kestrel_sandbox::run_server(config).await
}
