//! Task state machine and the closed set of task variants.
//!
//! The engine depends only on the [`Task`] trait. A concrete variant is
//! chosen once, when a definition is compiled, from the element's kind.

use crate::application::context::RequestContext;
use crate::application::graph::TaskGraph;
use crate::domain::definition::{ElementDefinition, ElementKind, ProcessDefinition, TaskId};
use crate::domain::instance::{Instance, TaskState};
use crate::domain::participant::{resolve_participants, Lane};
use crate::domain::ports::channels;
use crate::CoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

mod calculate;
mod email;
mod http;
mod live_form;
mod markers;
mod password_reset;
mod procedure;
mod query;
mod remote_form;
mod subprocess;

pub mod formula;
pub mod template;

pub use calculate::CalculateTask;
pub use email::EmailTask;
pub use http::HttpTask;
pub use live_form::{UserFormTask, INPUTS_SET};
pub use markers::{EndTask, ServiceTask, StartTask, TriggerTask};
pub use password_reset::PasswordResetUrlTask;
pub use procedure::ProcedureTask;
pub use query::QueryTask;
pub use remote_form::RemoteFormTask;
pub use subprocess::SubProcessTask;

/// Static identity of a task within the element graph
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    /// Element ID
    pub id: TaskId,
    /// Label used in references and logs
    pub name: String,
    /// Element kind
    pub kind: ElementKind,
    /// Lane the task sits in, resolved at compile time
    pub lane: Option<Lane>,
}

impl TaskNode {
    /// Build from an element definition
    pub fn from_element(element: &ElementDefinition, definition: &ProcessDefinition) -> Self {
        Self {
            id: TaskId::new(&element.id),
            name: element.label().to_string(),
            kind: element.kind,
            lane: element
                .lane
                .as_deref()
                .and_then(|lane| definition.lane(lane))
                .cloned(),
        }
    }

    /// Bare node, for tasks built outside a document
    pub fn new(id: impl Into<String>, kind: ElementKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: TaskId::new(id),
            kind,
            lane: None,
        }
    }
}

/// The polymorphic unit of execution
#[async_trait]
pub trait Task: Send + Sync + std::fmt::Debug {
    /// Static identity
    fn node(&self) -> &TaskNode;

    /// Task ID
    fn id(&self) -> &TaskId {
        &self.node().id
    }

    /// Run the task's business action.
    ///
    /// `Ok(true)` completes the task, `Ok(false)` leaves it waiting for an
    /// external event, `Err` halts the branch.
    async fn execute(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError>;

    /// Snapshot of this task's state
    fn my_state(&self, instance: &Instance) -> TaskState {
        instance.task_state(self.id())
    }

    /// Merge partial data into this task's state
    fn state_update(&self, instance: &mut Instance, partial: Map<String, Value>) {
        instance.state_update(self.id(), partial);
    }

    /// Mark this task completed
    fn state_completed(&self, instance: &mut Instance) {
        instance.state_completed(self.id());
    }

    /// Make this task eligible to run again
    fn reset(&self, instance: &mut Instance) {
        instance.reset(self.id());
    }

    /// Successors of this task in its graph, back edges included
    fn next_tasks<'g>(&self, graph: &'g TaskGraph) -> &'g [TaskId] {
        graph.successors(self.id())
    }

    /// Append to the task log
    fn log(&self, instance: &mut Instance, message: &str) {
        debug!(instance_id = %instance.id, task_id = %self.id(), "{}", message);
        instance.log(self.id(), message);
    }

    /// Record a failure against the instance and notify developers
    async fn on_error(&self, instance: &mut Instance, ctx: &RequestContext, err: &CoreError) {
        let node = self.node();
        error!(
            instance_id = %instance.id,
            task_id = %node.id,
            task = %node.name,
            error = %err,
            "Task failed"
        );
        instance.state_error(&node.id, &err.to_string());
        instance.log(&node.id, format!("Error: {}", err));

        let notice = json!({
            "instanceId": instance.id.0,
            "definitionId": instance.definition_id.0,
            "taskId": node.id.0,
            "task": node.name,
            "error": err.to_string(),
        });
        if let Err(e) = ctx
            .services
            .broadcaster
            .broadcast(channels::DEVELOPER, notice)
            .await
        {
            warn!(task_id = %node.id, error = %e, "Failed to publish developer notification");
        }
    }
}

/// Deserialize an element's config; a missing config is an empty object
pub(crate) fn parse_config<T: DeserializeOwned>(element: &ElementDefinition) -> Result<T, CoreError> {
    let config = match &element.config {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(config).map_err(|e| {
        CoreError::ValidationError(format!("Invalid config for element {}: {}", element.id, e))
    })
}

/// Users addressed by a task's lane
pub(crate) async fn lane_users(node: &TaskNode, ctx: &RequestContext) -> Result<Vec<String>, CoreError> {
    let lane = node.lane.as_ref().ok_or_else(|| {
        CoreError::ConfigurationError(format!("Task {} is not placed in a lane", node.id))
    })?;
    resolve_participants(lane, ctx.services.users.as_ref()).await
}

/// Build the task variant for an element
pub fn build_task(
    element: &ElementDefinition,
    definition: &ProcessDefinition,
) -> Result<Arc<dyn Task>, CoreError> {
    let node = TaskNode::from_element(element, definition);
    let task: Arc<dyn Task> = match element.kind {
        ElementKind::Trigger => Arc::new(TriggerTask::new(node)),
        ElementKind::Start => Arc::new(StartTask::new(node)),
        ElementKind::End => Arc::new(EndTask::new(node)),
        ElementKind::Service => Arc::new(ServiceTask::new(node)),
        ElementKind::BatchProcessing | ElementKind::PeriodClose => {
            Arc::new(ProcedureTask::new(node, parse_config(element)?))
        }
        ElementKind::Http => Arc::new(HttpTask::new(node, parse_config(element)?)),
        ElementKind::Calculate => Arc::new(CalculateTask::new(node, parse_config(element)?)),
        ElementKind::PasswordResetUrl => {
            Arc::new(PasswordResetUrlTask::new(node, parse_config(element)?))
        }
        ElementKind::SubProcess => {
            let graph = TaskGraph::compile(definition, Some(&element.id))?;
            Arc::new(SubProcessTask::new(node, parse_config(element)?, graph))
        }
        ElementKind::UserApproval | ElementKind::UserExternalForm => {
            Arc::new(RemoteFormTask::new(node, parse_config(element)?))
        }
        ElementKind::UserForm => Arc::new(UserFormTask::new(node, parse_config(element)?)),
        ElementKind::Email => Arc::new(EmailTask::new(node, parse_config(element)?)),
        ElementKind::Query => Arc::new(QueryTask::new(node, parse_config(element)?)),
    };
    Ok(task)
}

/// Turn a JSON value into a state map, wrapping non-objects under `value`
pub(crate) fn into_state(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
