//! Relay server: wires the state store and service adapters into a process
//! manager and serves the HTTP API.

use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use relay_core::{
    domain::ports::ObjectStore, DefinitionRepository, InstanceRepository, ProcessManager, Services,
};
use relay_state_inmemory::{
    InMemoryBroadcaster, InMemoryObjectStore, InMemorySecretStore, InMemoryServiceDispatch,
    InMemoryStateStoreProvider, InMemoryUserDirectory,
};

use crate::api;
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::remote::{GatewayClient, ReqwestHttpClient};

/// Which state store backs the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// In-process, lost on restart
    Memory,
    /// PostgreSQL
    Postgres,
}

impl StoreKind {
    /// Label used in health output
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Postgres => "postgres",
        }
    }
}

/// Shared state behind every handler
pub struct RelayServer {
    config: ServerConfig,
    manager: ProcessManager,
    store: StoreKind,
}

impl RelayServer {
    /// Assemble a server from an already-built process manager
    pub fn new(config: ServerConfig, manager: ProcessManager, store: StoreKind) -> Self {
        Self {
            config,
            manager,
            store,
        }
    }

    /// Build repositories and service adapters from configuration
    pub async fn from_config(config: ServerConfig) -> ServerResult<Self> {
        let stores = if config.store_url.starts_with("memory://") {
            info!("Using in-memory state store");
            let provider = InMemoryStateStoreProvider::new();
            let (instances, definitions) = provider.create_repositories();
            Stores {
                objects: Arc::new(InMemoryObjectStore::new()),
                instances,
                definitions,
                kind: StoreKind::Memory,
            }
        } else {
            postgres_stores(&config).await?
        };

        let services = build_services(&config, stores.objects)?;
        let manager = ProcessManager::new(
            stores.definitions,
            stores.instances,
            services,
            config.engine.clone(),
        );
        Ok(Self::new(config, manager, stores.kind))
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The process manager
    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    /// Backing store kind
    pub fn store(&self) -> StoreKind {
        self.store
    }

    /// Bind and serve until interrupted
    pub async fn run(self) -> ServerResult<()> {
        let address = self.config.listen_address();
        let router = api::build_router(Arc::new(self)).layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&address).await?;
        info!(address = %address, "Relay server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        info!("Relay server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("listen", &self.config.listen_address())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("Could not install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

struct Stores {
    objects: Arc<dyn ObjectStore>,
    instances: Arc<dyn InstanceRepository>,
    definitions: Arc<dyn DefinitionRepository>,
    kind: StoreKind,
}

/// Service ports: the gateway when `service_url` is set, in-process otherwise
fn build_services(
    config: &ServerConfig,
    objects: Arc<dyn ObjectStore>,
) -> ServerResult<Services> {
    let secrets = Arc::new(InMemorySecretStore::from_map(config.secrets.clone()));
    let http = Arc::new(ReqwestHttpClient::new()?);
    let users = Arc::new(InMemoryUserDirectory::default());

    let services = match &config.service_url {
        Some(url) => {
            let gateway = Arc::new(GatewayClient::new(url)?);
            Services {
                objects,
                secrets,
                dispatch: gateway.clone(),
                broadcaster: gateway,
                users,
                http,
            }
        }
        None => Services {
            objects,
            secrets,
            dispatch: Arc::new(InMemoryServiceDispatch::new()),
            broadcaster: Arc::new(InMemoryBroadcaster::default()),
            users,
            http,
        },
    };
    Ok(services)
}

#[cfg(feature = "postgres")]
async fn postgres_stores(config: &ServerConfig) -> ServerResult<Stores> {
    info!(store_url = %config.redacted_store_url(), "Using PostgreSQL state store");
    let provider =
        relay_state_postgres::PostgresStateStoreProvider::new(&config.store_url).await?;
    let (instances, definitions) = provider.create_repositories();
    Ok(Stores {
        objects: provider.object_store(),
        instances,
        definitions,
        kind: StoreKind::Postgres,
    })
}

#[cfg(not(feature = "postgres"))]
async fn postgres_stores(_config: &ServerConfig) -> ServerResult<Stores> {
    Err(crate::error::ServerError::ConfigError(
        "Built without the postgres feature".to_string(),
    ))
}
