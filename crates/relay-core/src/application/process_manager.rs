//! Process/Instance manager: definition cache, deduplicated instance creation,
//! and the inbound resume surface (`trigger`, `run`, `enter_inputs`).

use crate::application::context::{EngineConfig, RequestContext, Services};
use crate::application::engine::{EngineLoop, RunReport};
use crate::application::graph::CompiledProcess;
use crate::domain::definition::{DefinitionId, ElementKind, ProcessDefinition, TaskId};
use crate::domain::instance::{Instance, InstanceId, InstanceKey, TaskStatus};
use crate::domain::repository::{DefinitionRepository, InstanceRepository};
use crate::task::{into_state, INPUTS_SET};
use crate::CoreError;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Result of firing a trigger
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// A new instance was created and run
    Created {
        /// The instance after its first run
        instance: Instance,
        /// What the first run did
        report: RunReport,
    },
    /// An instance with this key already exists; nothing was run
    AlreadyTriggered {
        /// The duplicate key
        instance_key: InstanceKey,
    },
}

/// Entry point for starting and resuming process instances
pub struct ProcessManager {
    definitions: Arc<dyn DefinitionRepository>,
    instances: Arc<dyn InstanceRepository>,
    services: Services,
    config: EngineConfig,
    cache: DashMap<DefinitionId, Arc<CompiledProcess>>,
    locks: DashMap<InstanceId, Arc<Mutex<()>>>,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        instances: Arc<dyn InstanceRepository>,
        services: Services,
        config: EngineConfig,
    ) -> Self {
        Self {
            definitions,
            instances,
            services,
            config,
            cache: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve the compiled definition of a diagram document.
    ///
    /// The ID is the content hash of `source`, so compiling the same document
    /// concurrently stores identical definitions.
    pub async fn definition_for(&self, source: &str) -> Result<Arc<CompiledProcess>, CoreError> {
        let id = DefinitionId::for_source(source);
        if let Some(compiled) = self.cache.get(&id) {
            return Ok(compiled.clone());
        }

        let definition = match self.definitions.find_by_id(&id).await? {
            Some(definition) => definition,
            None => {
                let definition = ProcessDefinition::compile(source)?;
                self.definitions.save(&definition, source).await?;
                info!(definition_id = %id, name = %definition.name, "Process definition compiled");
                definition
            }
        };
        self.cache_compiled(definition)
    }

    /// The compiled definition for an ID already stored
    pub async fn compiled(&self, id: &DefinitionId) -> Result<Arc<CompiledProcess>, CoreError> {
        if let Some(compiled) = self.cache.get(id) {
            return Ok(compiled.clone());
        }
        let definition = self
            .definitions
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::DefinitionNotFound(id.to_string()))?;
        self.cache_compiled(definition)
    }

    fn cache_compiled(&self, definition: ProcessDefinition) -> Result<Arc<CompiledProcess>, CoreError> {
        let id = definition.id.clone();
        let compiled = Arc::new(CompiledProcess::new(definition)?);
        self.cache.insert(id, compiled.clone());
        Ok(compiled)
    }

    /// Fire the trigger of a diagram with a payload.
    ///
    /// Builds a fresh context and delegates to [`ProcessManager::instance_new`].
    pub async fn trigger(
        &self,
        source: &str,
        payload: Value,
        instance_key: InstanceKey,
    ) -> Result<TriggerOutcome, CoreError> {
        let context = json!({
            "instanceKey": instance_key.0,
            "triggeredAt": Utc::now().to_rfc3339(),
        });
        self.instance_new(source, context, payload, instance_key).await
    }

    /// Create an instance with the trigger pre-completed, then run it.
    ///
    /// A duplicate instance key is a retried trigger: no second instance is
    /// created and nothing runs.
    pub async fn instance_new(
        &self,
        source: &str,
        context: Value,
        payload: Value,
        instance_key: InstanceKey,
    ) -> Result<TriggerOutcome, CoreError> {
        let compiled = self.definition_for(source).await?;

        let mut instance = Instance::new(compiled.definition.id.clone(), instance_key, context);
        let trigger = compiled.graph.start().clone();
        instance.state_update(&trigger, into_state(payload));
        instance.state_completed(&trigger);

        match self.instances.create(&instance).await {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {
                info!(
                    instance_key = %instance.instance_key,
                    definition_id = %compiled.definition.id,
                    "Instance key already triggered, skipping"
                );
                return Ok(TriggerOutcome::AlreadyTriggered {
                    instance_key: instance.instance_key,
                });
            }
            Err(err) => return Err(err),
        }
        info!(
            instance_id = %instance.id,
            instance_key = %instance.instance_key,
            definition_id = %compiled.definition.id,
            "Instance created"
        );

        let _guard = self.lock_instance(&instance.id).await;
        let persisted = instance.version();
        let report = self.drive(&compiled, &mut instance, persisted).await?;
        Ok(TriggerOutcome::Created { instance, report })
    }

    /// Resume an instance from its persisted state
    pub async fn run(&self, id: &InstanceId) -> Result<(Instance, RunReport), CoreError> {
        let _guard = self.lock_instance(id).await;

        let mut instance = self.load(id).await?;
        let persisted = instance.version();
        let compiled = self.compiled(&instance.definition_id).await?;
        let report = self.drive(&compiled, &mut instance, persisted).await?;
        Ok((instance, report))
    }

    /// Supply submitted values to a waiting user-form task and resume.
    ///
    /// Only an in-engine user form that has pushed its request and is
    /// waiting accepts inputs. The task completes on the next loop pass.
    pub async fn enter_inputs(
        &self,
        id: &InstanceId,
        task_id: &TaskId,
        values: Map<String, Value>,
    ) -> Result<(Instance, RunReport), CoreError> {
        let _guard = self.lock_instance(id).await;

        let mut instance = self.load(id).await?;
        let compiled = self.compiled(&instance.definition_id).await?;
        let element = compiled
            .definition
            .element(&task_id.0)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        if element.kind != ElementKind::UserForm {
            return Err(CoreError::InvalidState(format!(
                "Task {} is not a user form",
                task_id
            )));
        }
        let status = instance.status_of(task_id);
        if status != TaskStatus::Waiting {
            return Err(CoreError::InvalidState(format!(
                "User form {} is {:?}, not waiting for inputs",
                task_id, status
            )));
        }

        let persisted = instance.version();
        let mut data = values;
        data.insert(INPUTS_SET.to_string(), Value::Bool(true));
        instance.state_update(task_id, data);
        debug!(instance_id = %instance.id, task_id = %task_id, "Inputs entered");

        let report = self.drive(&compiled, &mut instance, persisted).await?;
        Ok((instance, report))
    }

    /// Look up an instance
    pub async fn find_instance(&self, id: &InstanceId) -> Result<Option<Instance>, CoreError> {
        self.instances.find_by_id(id).await
    }

    async fn load(&self, id: &InstanceId) -> Result<Instance, CoreError> {
        self.instances
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::InstanceNotFound(id.to_string()))
    }

    /// Serialise loop passes per instance; the entry goes away with the last holder
    async fn lock_instance(&self, id: &InstanceId) -> InstanceGuard<'_> {
        let lock = self.locks.entry(id.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        InstanceGuard {
            locks: &self.locks,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    async fn drive(
        &self,
        compiled: &CompiledProcess,
        instance: &mut Instance,
        persisted_version: u64,
    ) -> Result<RunReport, CoreError> {
        let ctx = RequestContext::new(self.services.clone(), self.config.clone())
            .with_references(compiled.references.clone());
        EngineLoop::new(&compiled.graph)
            .with_checkpoints(self.instances.clone(), persisted_version)
            .run(instance, &ctx)
            .await
    }
}

struct InstanceGuard<'a> {
    locks: &'a DashMap<InstanceId, Arc<Mutex<()>>>,
    id: InstanceId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own handle left: nobody holds or awaits this lock.
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("config", &self.config)
            .field("cached_definitions", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::{InstanceStatus, TaskStatus};
    use crate::domain::repository::{MockDefinitionRepository, MockInstanceRepository};
    use crate::test_support::fixture;
    use mockall::predicate::eq;

    const SOURCE: &str = r#"{"name":"double","elements":[
        {"id":"t","name":"Trigger","kind":"trigger"},
        {"id":"calc","name":"Calculate","kind":"calculate","config":{"formula":"{Trigger}.amount * 2"}},
        {"id":"form","kind":"user_form","lane":"ops","config":{"form":{"fields":["note"]}}},
        {"id":"e","kind":"end"}],
        "connections":[{"from":"t","to":"calc"},{"from":"calc","to":"form"},{"from":"form","to":"e"}],
        "lanes":[{"id":"ops","name":"Ops","use_account":true,"account":["u1"]}]}"#;

    fn manager(definitions: MockDefinitionRepository, instances: MockInstanceRepository) -> ProcessManager {
        let fx = fixture();
        fx.users.add("u1", "ada", &[]);
        ProcessManager::new(
            Arc::new(definitions),
            Arc::new(instances),
            fx.services(),
            EngineConfig::default(),
        )
    }

    fn stored_definitions() -> MockDefinitionRepository {
        let mut definitions = MockDefinitionRepository::new();
        definitions
            .expect_find_by_id()
            .returning(|_| Ok(Some(ProcessDefinition::compile(SOURCE).unwrap())));
        definitions
    }

    #[tokio::test]
    async fn test_definition_for_compiles_once_and_caches() {
        let mut definitions = MockDefinitionRepository::new();
        definitions
            .expect_find_by_id()
            .with(eq(DefinitionId::for_source(SOURCE)))
            .times(1)
            .returning(|_| Ok(None));
        definitions.expect_save().times(1).returning(|_, _| Ok(()));
        let manager = manager(definitions, MockInstanceRepository::new());

        let first = manager.definition_for(SOURCE).await.unwrap();
        let second = manager.definition_for(SOURCE).await.unwrap();
        assert_eq!(first.definition.id, second.definition.id);
        assert!(first.definition.id.0.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_trigger_creates_and_runs_until_form_waits() {
        let mut instances = MockInstanceRepository::new();
        instances.expect_create().times(1).returning(|_| Ok(()));
        instances.expect_save().returning(|_, _| Ok(()));
        let manager = manager(stored_definitions(), instances);

        let outcome = manager
            .trigger(SOURCE, json!({"amount": 100}), InstanceKey("evt-42".into()))
            .await
            .unwrap();
        let TriggerOutcome::Created { instance, report } = outcome else {
            panic!("expected a new instance");
        };
        assert_eq!(instance.status, InstanceStatus::Waiting);
        assert_eq!(instance.task_state(&TaskId::new("calc")).get("value"), Some(&json!(200)));
        assert_eq!(instance.status_of(&TaskId::new("form")), TaskStatus::Waiting);
        assert_eq!(report.completed, vec![TaskId::new("calc")]);
        assert_eq!(instance.context["instanceKey"], json!("evt-42"));
    }

    #[tokio::test]
    async fn test_duplicate_key_is_not_an_error_and_runs_nothing() {
        let mut instances = MockInstanceRepository::new();
        instances
            .expect_create()
            .times(1)
            .returning(|_| Err(CoreError::AlreadyExists("instance_key evt-42".into())));
        instances.expect_save().never();
        let manager = manager(stored_definitions(), instances);

        let outcome = manager
            .trigger(SOURCE, json!({"amount": 100}), InstanceKey("evt-42".into()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TriggerOutcome::AlreadyTriggered {
                instance_key: InstanceKey("evt-42".into())
            }
        );
    }

    #[tokio::test]
    async fn test_enter_inputs_completes_form_on_next_pass() {
        let manager = manager(stored_definitions(), MockInstanceRepository::new());
        let compiled = manager.definition_for(SOURCE).await.unwrap();

        let mut waiting = Instance::new(compiled.definition.id.clone(), InstanceKey("k".into()), json!({}));
        for (task, data) in [("t", json!({"amount": 1})), ("calc", json!({"value": 2}))] {
            waiting.state_update(&TaskId::new(task), into_state(data));
            waiting.state_completed(&TaskId::new(task));
        }
        waiting.state_update(&TaskId::new("form"), into_state(json!({"_pushed": true})));
        waiting.state_waiting(&TaskId::new("form"));
        let id = waiting.id.clone();

        let mut instances = MockInstanceRepository::new();
        instances
            .expect_find_by_id()
            .with(eq(id.clone()))
            .returning(move |_| Ok(Some(waiting.clone())));
        instances.expect_save().returning(|_, _| Ok(()));
        let manager = ProcessManager { instances: Arc::new(instances), ..manager };

        let mut values = Map::new();
        values.insert("note".into(), json!("ok"));
        let (instance, report) = manager
            .enter_inputs(&id, &TaskId::new("form"), values)
            .await
            .unwrap();

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(report.completed, vec![TaskId::new("form"), TaskId::new("e")]);
        let form = instance.task_state(&TaskId::new("form"));
        assert_eq!(form.get("note"), Some(&json!("ok")));
        assert_eq!(form.get(INPUTS_SET), None);
    }

    fn instance_with(completed: &[(&str, Value)]) -> Instance {
        let id = DefinitionId::for_source(SOURCE);
        let mut instance = Instance::new(id, InstanceKey("k".into()), json!({}));
        for (task, data) in completed {
            instance.state_update(&TaskId::new(*task), into_state(data.clone()));
            instance.state_completed(&TaskId::new(*task));
        }
        instance
    }

    #[tokio::test]
    async fn test_enter_inputs_requires_a_waiting_user_form() {
        let manager = manager(stored_definitions(), MockInstanceRepository::new());
        // The form's predecessor has not completed yet
        let early = instance_with(&[("t", json!({"amount": 1}))]);
        let id = early.id.clone();

        let mut instances = MockInstanceRepository::new();
        instances
            .expect_find_by_id()
            .returning(move |_| Ok(Some(early.clone())));
        instances.expect_save().never();
        let manager = ProcessManager { instances: Arc::new(instances), ..manager };

        let err = manager
            .enter_inputs(&id, &TaskId::new("form"), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));

        let err = manager
            .enter_inputs(&id, &TaskId::new("calc"), Map::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidState("Task calc is not a user form".into())
        );
        assert!(manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_instance_locks_are_released_after_each_run() {
        let manager = manager(stored_definitions(), MockInstanceRepository::new());
        let instance = instance_with(&[("t", json!({"amount": 1}))]);
        let id = instance.id.clone();

        let mut instances = MockInstanceRepository::new();
        instances
            .expect_find_by_id()
            .returning(move |_| Ok(Some(instance.clone())));
        instances.expect_save().returning(|_, _| Ok(()));
        let manager = ProcessManager { instances: Arc::new(instances), ..manager };

        let (first, second) = tokio::join!(manager.run(&id), manager.run(&id));
        assert!(first.is_ok() && second.is_ok());
        assert!(manager.locks.is_empty());

        manager.run(&id).await.unwrap();
        assert!(manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_instance_and_task_are_reported() {
        let mut instances = MockInstanceRepository::new();
        instances.expect_find_by_id().returning(|_| Ok(None));
        let manager = manager(stored_definitions(), instances);

        let err = manager.run(&InstanceId("nope".into())).await.unwrap_err();
        assert_eq!(err, CoreError::InstanceNotFound("nope".into()));

        let err = manager
            .enter_inputs(&InstanceId("nope".into()), &TaskId::new("form"), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InstanceNotFound(_)));
    }
}
