// Relay Tests
//
// Shared harness for the end-to-end scenarios under `scenarios/`. Every
// scenario runs a real ProcessManager over the in-memory stack.

use std::sync::Arc;

use relay_core::{
    domain::ports::{ObjectType, User},
    CoreError, EngineConfig, Instance, InstanceKey, ProcessManager, TriggerOutcome,
};
use relay_state_inmemory::{InMemoryServices, InMemoryStateStoreProvider};
use serde_json::Value;

/// A process manager wired to in-memory repositories and ports
pub struct Harness {
    /// Every service port, for seeding and inspection
    pub services: InMemoryServices,
    /// Repositories
    pub store: InMemoryStateStoreProvider,
    /// The manager under test
    pub manager: Arc<ProcessManager>,
}

impl Harness {
    /// Harness with the default engine configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Harness with a custom engine configuration
    pub fn with_config(config: EngineConfig) -> Self {
        let services = InMemoryServices::new();
        let store = InMemoryStateStoreProvider::new();
        let (instances, definitions) = store.create_repositories();
        let manager = Arc::new(ProcessManager::new(
            definitions,
            instances,
            services.services(),
            config,
        ));
        Self {
            services,
            store,
            manager,
        }
    }

    /// Register a business object and its rows
    pub async fn define_object(&self, schema: Value, rows: Vec<Value>) {
        let object: ObjectType = serde_json::from_value(schema).expect("valid object schema");
        self.services.objects.define(object, rows).await;
    }

    /// Register a user with role memberships
    pub async fn add_user(&self, id: &str, username: &str, roles: &[&str]) {
        let user = User {
            id: id.to_string(),
            username: Some(username.to_string()),
            email: None,
        };
        self.services.users.add(user, roles).await;
    }

    /// Fire a trigger
    pub async fn trigger(
        &self,
        source: &str,
        payload: Value,
        key: &str,
    ) -> Result<TriggerOutcome, CoreError> {
        self.manager
            .trigger(source, payload, InstanceKey(key.to_string()))
            .await
    }

    /// Fire a trigger that must create a new instance
    pub async fn trigger_new(&self, source: &str, payload: Value, key: &str) -> Instance {
        match self.trigger(source, payload, key).await.expect("trigger succeeds") {
            TriggerOutcome::Created { instance, .. } => instance,
            TriggerOutcome::AlreadyTriggered { instance_key } => {
                panic!("instance key {} was already triggered", instance_key)
            }
        }
    }

    /// Number of stored instances
    pub async fn instance_count(&self) -> usize {
        self.store.instance_repository().len().await
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Messages of a task's log
pub fn log_messages(instance: &Instance, task_id: &str) -> Vec<String> {
    instance
        .task_state(&relay_core::TaskId::new(task_id))
        .log
        .into_iter()
        .map(|entry| entry.message)
        .collect()
}
