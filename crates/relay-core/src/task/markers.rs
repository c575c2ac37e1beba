//! Structural elements: trigger, start, end, and the abstract service task.

use super::{Task, TaskNode};
use crate::application::context::RequestContext;
use crate::domain::instance::Instance;
use crate::CoreError;
use async_trait::async_trait;

/// Process start node.
///
/// Firing lives in [`ProcessManager::trigger`](crate::ProcessManager::trigger):
/// the manager builds the context, stores the payload as this task's data and
/// marks it completed before the first loop pass, so `execute` never runs for
/// a fired instance.
#[derive(Debug)]
pub struct TriggerTask {
    node: TaskNode,
}

impl TriggerTask {
    /// Create a trigger task
    pub fn new(node: TaskNode) -> Self {
        Self { node }
    }
}

#[async_trait]
impl Task for TriggerTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, _ctx: &RequestContext) -> Result<bool, CoreError> {
        // Only reached when an instance is run without having been fired.
        self.log(instance, "Trigger ran without a payload");
        Ok(true)
    }
}

/// Start node of a sub-process scope
#[derive(Debug)]
pub struct StartTask {
    node: TaskNode,
}

impl StartTask {
    /// Create a start task
    pub fn new(node: TaskNode) -> Self {
        Self { node }
    }
}

#[async_trait]
impl Task for StartTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, _instance: &mut Instance, _ctx: &RequestContext) -> Result<bool, CoreError> {
        Ok(true)
    }
}

/// Sink node
#[derive(Debug)]
pub struct EndTask {
    node: TaskNode,
}

impl EndTask {
    /// Create an end task
    pub fn new(node: TaskNode) -> Self {
        Self { node }
    }
}

#[async_trait]
impl Task for EndTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, _ctx: &RequestContext) -> Result<bool, CoreError> {
        self.log(instance, "Reached end");
        Ok(true)
    }
}

/// Abstract service task. Never executable on its own.
#[derive(Debug)]
pub struct ServiceTask {
    node: TaskNode,
}

impl ServiceTask {
    /// Create a service task
    pub fn new(node: TaskNode) -> Self {
        Self { node }
    }
}

#[async_trait]
impl Task for ServiceTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, _instance: &mut Instance, _ctx: &RequestContext) -> Result<bool, CoreError> {
        Err(CoreError::ConfigurationError(format!(
            "Service task {} has no concrete implementation",
            self.node.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::definition::ElementKind;
    use crate::test_support::fixture;

    #[tokio::test]
    async fn test_service_task_is_a_configuration_error() {
        let fx = fixture();
        let mut instance = fx.instance();
        let task = ServiceTask::new(TaskNode::new("svc", ElementKind::Service));
        let err = task.execute(&mut instance, &fx.ctx()).await.unwrap_err();
        assert!(matches!(err, CoreError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_unfired_trigger_completes_and_notes_the_missing_payload() {
        let fx = fixture();
        let mut instance = fx.instance();
        let task = TriggerTask::new(TaskNode::new("trigger", ElementKind::Trigger));
        assert!(task.execute(&mut instance, &fx.ctx()).await.unwrap());
        assert_eq!(task.my_state(&instance).log.len(), 1);
    }

    #[tokio::test]
    async fn test_end_task_completes() {
        let fx = fixture();
        let mut instance = fx.instance();
        let task = EndTask::new(TaskNode::new("end", ElementKind::End));
        assert!(task.execute(&mut instance, &fx.ctx()).await.unwrap());
        assert_eq!(task.my_state(&instance).log.len(), 1);
    }
}
