use super::{Task, TaskNode};
use crate::application::context::RequestContext;
use crate::application::engine::EngineLoop;
use crate::application::graph::TaskGraph;
use crate::domain::instance::Instance;
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Sub-process task configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SubProcessConfig {
    /// Reference to the input collection; a scalar becomes a one-item collection
    pub input: String,
    /// Label or id of the sub-task whose data is collected per item
    #[serde(default)]
    pub output: Option<String>,
}

/// Runs its own sub-graph once per input item, strictly in order.
///
/// Each item seeds the scope's start task with `{item, index}`. Sub-task
/// failures are handled by the sub-task's own `on_error` and never abort
/// the remaining items. A sub-task cannot suspend an item: one still waiting
/// when its item quiesces is failed, and the item is listed as `incomplete`.
#[derive(Debug)]
pub struct SubProcessTask {
    node: TaskNode,
    config: SubProcessConfig,
    graph: TaskGraph,
}

impl SubProcessTask {
    /// Create a sub-process task over a compiled sub-graph
    pub fn new(node: TaskNode, config: SubProcessConfig, graph: TaskGraph) -> Self {
        Self {
            node,
            config,
            graph,
        }
    }

    /// The nested graph
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    fn collection(&self, instance: &Instance, ctx: &RequestContext) -> Vec<Value> {
        match ctx.references.resolve(instance, &self.config.input) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => {
                warn!(
                    task_id = %self.node.id,
                    input = %self.config.input,
                    "Sub-process input resolved to nothing"
                );
                Vec::new()
            }
            Some(item) => vec![item],
        }
    }

    fn reset_scope(&self, instance: &mut Instance) {
        for task in self.graph.tasks() {
            task.reset(instance);
        }
    }
}

#[async_trait]
impl Task for SubProcessTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError> {
        let items = self.collection(instance, ctx);
        let output = match &self.config.output {
            Some(label) => Some(ctx.references.task_for(label).cloned().ok_or_else(|| {
                CoreError::ConfigurationError(format!(
                    "Sub-process {} output '{}' is not a task",
                    self.node.id, label
                ))
            })?),
            None => None,
        };

        let start = self.graph.start().clone();
        let engine = EngineLoop::nested(&self.graph);
        let mut results = Vec::with_capacity(items.len());
        let mut incomplete = Vec::new();
        let count = items.len();

        for (index, item) in items.into_iter().enumerate() {
            self.reset_scope(instance);
            let mut seed = Map::new();
            seed.insert("item".to_string(), item);
            seed.insert("index".to_string(), json!(index));
            instance.state_update(&start, seed);
            instance.state_completed(&start);

            let report = engine.run(instance, ctx).await?;
            debug!(
                instance_id = %instance.id,
                task_id = %self.node.id,
                index,
                passes = report.passes,
                errored = report.errored.len(),
                "Sub-process item finished"
            );
            if !report.waiting.is_empty() {
                let err = CoreError::InvalidState(format!(
                    "Item {} of sub-process {} cannot wait for an external event",
                    index, self.node.id
                ));
                for id in &report.waiting {
                    if let Some(task) = self.graph.task(id) {
                        task.on_error(instance, ctx, &err).await;
                    }
                }
                let waiting: Vec<&str> = report.waiting.iter().map(|t| t.0.as_str()).collect();
                self.log(
                    instance,
                    &format!("Item {} abandoned waiting task(s): {}", index, waiting.join(", ")),
                );
                incomplete.push(json!(index));
            }
            if let Some(output) = &output {
                results.push(Value::Object(instance.task_state(output).data));
            }
        }

        self.log(instance, &format!("Processed {} item(s)", count));
        let mut data = Map::new();
        data.insert("count".to_string(), json!(count));
        data.insert("results".to_string(), Value::Array(results));
        data.insert("incomplete".to_string(), Value::Array(incomplete));
        self.state_update(instance, data);
        Ok(true)
    }
}
