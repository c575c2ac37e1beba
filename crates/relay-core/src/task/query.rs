use super::{Task, TaskNode};
use crate::application::context::RequestContext;
use crate::domain::instance::Instance;
use crate::ql::{OperatorSpec, Pipeline, QlEnv};
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;

/// Query task configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Root object of the pipeline
    pub object: String,
    /// Operators, applied in order
    #[serde(default)]
    pub pipeline: Vec<OperatorSpec>,
}

/// Runs a QL pipeline; save operators write into this task's state
#[derive(Debug)]
pub struct QueryTask {
    node: TaskNode,
    pipeline: Pipeline,
}

impl QueryTask {
    /// Create a query task
    pub fn new(node: TaskNode, config: QueryConfig) -> Self {
        Self {
            node,
            pipeline: Pipeline::new(config.object, &config.pipeline),
        }
    }
}

#[async_trait]
impl Task for QueryTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError> {
        let task_id = self.id().clone();
        let output = {
            let mut env = QlEnv {
                instance: &mut *instance,
                task_id: &task_id,
                ctx,
            };
            self.pipeline.run(&mut env).await?
        };
        for diagnostic in &output.diagnostics {
            self.log(instance, diagnostic);
        }
        self.log(instance, &format!("Pipeline {}", output.lineage().join(" -> ")));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::definition::{ElementKind, TaskId};
    use crate::test_support::{fixture, object};
    use serde_json::json;

    fn task(config: serde_json::Value) -> QueryTask {
        QueryTask::new(
            TaskNode::new("query", ElementKind::Query),
            serde_json::from_value(config).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_runs_pipeline_and_saves_into_own_state() {
        let fx = fixture();
        fx.objects.define(
            object("order", json!([{"id": "total", "column": "total"}])),
            vec![json!({"id": 42, "total": 100})],
        );
        let mut instance = fx.instance();
        fx.seed(&mut instance, "t1", json!({"order": 42}));
        let task = task(json!({
            "object": "order",
            "pipeline": [
                {"op": "find", "conditions": [{"field": "_PK", "value": {"ref": "Trigger.order"}}]},
                {"op": "set_first"},
                {"op": "row_save", "key": "order"}
            ]
        }));

        assert!(task.execute(&mut instance, &fx.ctx()).await.unwrap());
        let state = instance.task_state(&TaskId::new("query"));
        assert_eq!(state.get("order"), Some(&json!({"id": 42, "total": 100})));
        assert!(state.log.last().unwrap().message.contains("find -> set_first -> row_save"));
    }

    #[tokio::test]
    async fn test_diagnostics_land_in_task_log() {
        let fx = fixture();
        fx.objects.define(object("order", json!([])), Vec::new());
        let mut instance = fx.instance();
        let task = task(json!({
            "object": "order",
            "pipeline": [{"op": "load", "from": "Trigger.order"}, {"op": "set_first"}]
        }));

        assert!(task.execute(&mut instance, &fx.ctx()).await.unwrap());
        let log = instance.task_state(&TaskId::new("query")).log;
        assert_eq!(log.len(), 3);
        assert!(log[0].message.starts_with("load:"));
        assert!(log[1].message.starts_with("set_first:"));
    }
}
