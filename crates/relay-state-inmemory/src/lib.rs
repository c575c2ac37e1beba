//! In-memory state store implementation for the Relay platform
//!
//! This crate provides in-memory implementations of the repository and
//! service-port interfaces defined in relay-core. It backs the server's
//! `memory://` mode and doubles as the fixture library for tests.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod repositories;
pub use repositories::{InMemoryDefinitionRepository, InMemoryInstanceRepository, InstanceTable};

pub mod services;
pub use services::{
    ChannelHandler, Delivery, InMemoryBroadcaster, InMemoryObjectStore, InMemorySecretStore,
    InMemoryServiceDispatch, InMemoryServices, InMemoryUserDirectory, ProcedureHandler,
    StubHttpClient,
};

use relay_core::{
    domain::definition::ProcessDefinition,
    domain::repository::{DefinitionRepository, InstanceRepository},
};

/// Provider for in-memory repositories sharing one backing store
#[derive(Default)]
pub struct InMemoryStateStoreProvider {
    // Instance rows and the instance-key index
    instances: Arc<RwLock<InstanceTable>>,

    // Definitions keyed by content hash, with their source documents
    definitions: Arc<RwLock<HashMap<String, (ProcessDefinition, String)>>>,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance repository over the shared store
    pub fn instance_repository(&self) -> Arc<InMemoryInstanceRepository> {
        Arc::new(InMemoryInstanceRepository::new(self.instances.clone()))
    }

    /// Definition repository over the shared store
    pub fn definition_repository(&self) -> Arc<InMemoryDefinitionRepository> {
        Arc::new(InMemoryDefinitionRepository::new(self.definitions.clone()))
    }

    /// Create repositories for use with the process manager
    pub fn create_repositories(
        &self,
    ) -> (Arc<dyn InstanceRepository>, Arc<dyn DefinitionRepository>) {
        (self.instance_repository(), self.definition_repository())
    }
}
