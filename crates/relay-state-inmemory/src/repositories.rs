use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use async_trait::async_trait;

use relay_core::{
    domain::definition::{DefinitionId, ProcessDefinition},
    domain::instance::{Instance, InstanceId, InstanceKey},
    domain::repository::{DefinitionRepository, InstanceRepository},
    CoreError,
};

/// Instance rows plus the unique instance-key index
#[derive(Default)]
pub struct InstanceTable {
    rows: HashMap<String, Instance>,
    keys: HashMap<String, String>,
}

/// In-memory implementation of the InstanceRepository
pub struct InMemoryInstanceRepository {
    table: Arc<RwLock<InstanceTable>>,
}

impl InMemoryInstanceRepository {
    /// Create a new in-memory instance repository
    pub fn new(table: Arc<RwLock<InstanceTable>>) -> Self {
        Self { table }
    }

    /// Number of stored instances
    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }

    /// Whether no instance is stored
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn create(&self, instance: &Instance) -> Result<(), CoreError> {
        // Check and insert under one write lock so concurrent triggers race on the index.
        let mut table = self.table.write().await;
        if table.keys.contains_key(&instance.instance_key.0) {
            return Err(CoreError::AlreadyExists(format!(
                "instance_key {}",
                instance.instance_key
            )));
        }
        if table.rows.contains_key(&instance.id.0) {
            return Err(CoreError::AlreadyExists(format!("instance {}", instance.id)));
        }
        table
            .keys
            .insert(instance.instance_key.0.clone(), instance.id.0.clone());
        table.rows.insert(instance.id.0.clone(), instance.clone());
        debug!(instance_id = %instance.id, instance_key = %instance.instance_key, "Instance stored");
        Ok(())
    }

    async fn find_by_id(&self, id: &InstanceId) -> Result<Option<Instance>, CoreError> {
        let table = self.table.read().await;
        Ok(table.rows.get(&id.0).cloned())
    }

    async fn find_by_key(&self, key: &InstanceKey) -> Result<Option<Instance>, CoreError> {
        let table = self.table.read().await;
        Ok(table
            .keys
            .get(&key.0)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn save(&self, instance: &Instance, expected_version: u64) -> Result<(), CoreError> {
        let mut table = self.table.write().await;
        match table.rows.get_mut(&instance.id.0) {
            Some(row) if row.version() == expected_version => {
                *row = instance.clone();
                Ok(())
            }
            Some(row) => Err(CoreError::VersionConflict(format!(
                "instance {} is at version {}, expected {}",
                instance.id,
                row.version(),
                expected_version
            ))),
            None => Err(CoreError::InstanceNotFound(instance.id.to_string())),
        }
    }
}

/// In-memory implementation of the DefinitionRepository
pub struct InMemoryDefinitionRepository {
    definitions: Arc<RwLock<HashMap<String, (ProcessDefinition, String)>>>,
}

impl InMemoryDefinitionRepository {
    /// Create a new in-memory definition repository
    pub fn new(definitions: Arc<RwLock<HashMap<String, (ProcessDefinition, String)>>>) -> Self {
        Self { definitions }
    }

    /// The raw document a definition was compiled from
    pub async fn source_of(&self, id: &DefinitionId) -> Option<String> {
        let definitions = self.definitions.read().await;
        definitions.get(&id.0).map(|(_, source)| source.clone())
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn find_by_id(&self, id: &DefinitionId) -> Result<Option<ProcessDefinition>, CoreError> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(&id.0).map(|(definition, _)| definition.clone()))
    }

    async fn save(&self, definition: &ProcessDefinition, source: &str) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        definitions
            .entry(definition.id.0.clone())
            .or_insert_with(|| (definition.clone(), source.to_string()));
        Ok(())
    }
}
