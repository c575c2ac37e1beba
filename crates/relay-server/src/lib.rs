//!
//! Relay Server - HTTP surface of the Relay process engine
//!
//! Exposes the inbound resume interface (`trigger`, `run`, `enter inputs`)
//! over HTTP and wires the configured state store and outbound adapters.

/// API module
pub mod api;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Outbound HTTP adapters
pub mod remote;

/// Server module
pub mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::{RelayServer, StoreKind};

/// Run function
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    init_logging(&config);

    let server = RelayServer::from_config(config).await?;
    server.run().await
}

/// Initialize logging
///
/// `RUST_LOG` wins over the configured level. `RELAY_LOG_FORMAT=json` switches
/// to JSON lines.
pub fn init_logging(config: &ServerConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let json = std::env::var("RELAY_LOG_FORMAT").map_or(false, |f| f.eq_ignore_ascii_case("json"));
    let result = if json {
        fmt().with_env_filter(filter).with_target(true).json().try_init()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()
    };
    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
