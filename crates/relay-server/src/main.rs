use anyhow::{Context, Result};
use relay_server::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from relay.toml and RELAY_* environment variables
    let config = ServerConfig::load().context("Failed to load configuration")?;

    relay_server::run(config).await.context("Server error")?;

    Ok(())
}
