//! Repository traits for the Relay core
//!
//! Persistence is supplied by external crates. The instance-key uniqueness
//! constraint lives here, at the storage boundary, not in the engine.

use async_trait::async_trait;

use super::definition::{DefinitionId, ProcessDefinition};
use super::instance::{Instance, InstanceId, InstanceKey};
use crate::CoreError;

/// Repository for process instances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Insert a new instance.
    ///
    /// Returns `CoreError::AlreadyExists` when another instance already holds
    /// the same instance key.
    async fn create(&self, instance: &Instance) -> Result<(), CoreError>;

    /// Find an instance by ID
    async fn find_by_id(&self, id: &InstanceId) -> Result<Option<Instance>, CoreError>;

    /// Find an instance by its deduplication key
    async fn find_by_key(&self, key: &InstanceKey) -> Result<Option<Instance>, CoreError>;

    /// Save the current state of an existing instance.
    ///
    /// The write only applies while the stored version still equals
    /// `expected_version`, the version this caller last loaded or saved.
    /// Otherwise another writer got there first and the call returns
    /// `CoreError::VersionConflict`.
    async fn save(&self, instance: &Instance, expected_version: u64) -> Result<(), CoreError>;
}

/// Repository for compiled process definitions, keyed by content hash
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Find a definition by ID
    async fn find_by_id(&self, id: &DefinitionId) -> Result<Option<ProcessDefinition>, CoreError>;

    /// Store a definition. Saving the same ID twice is a no-op.
    async fn save(&self, definition: &ProcessDefinition, source: &str) -> Result<(), CoreError>;
}
