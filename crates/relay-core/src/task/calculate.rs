use super::formula::{evaluate, number_value};
use super::{Task, TaskNode};
use crate::application::context::RequestContext;
use crate::domain::instance::Instance;
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Calculate task configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CalculateConfig {
    /// Formula with `{Label}.path` placeholders, e.g. `{Trigger}.amount * 2`
    pub formula: String,
}

/// Evaluates an arithmetic formula over prior task outputs and stores `{value}`
#[derive(Debug)]
pub struct CalculateTask {
    node: TaskNode,
    config: CalculateConfig,
}

impl CalculateTask {
    /// Create a calculate task
    pub fn new(node: TaskNode, config: CalculateConfig) -> Self {
        Self { node, config }
    }

    fn expand(&self, instance: &Instance, ctx: &RequestContext) -> Result<String, CoreError> {
        let mut unresolved = None;
        let expanded = ctx
            .references
            .substitute(instance, &self.config.formula, |reference, value| {
                match value.as_ref().and_then(numeric) {
                    Some(n) => format!("({})", n),
                    None => {
                        unresolved.get_or_insert_with(|| reference.to_string());
                        String::new()
                    }
                }
            });
        match unresolved {
            Some(reference) => Err(CoreError::ExpressionError(format!(
                "Reference '{}' is not a number",
                reference
            ))),
            None => Ok(expanded),
        }
    }
}

/// Numbers and numeric strings
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl Task for CalculateTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError> {
        let expression = self.expand(instance, ctx)?;
        let result = evaluate(&expression)?;
        self.log(instance, &format!("{} = {}", self.config.formula, result));

        let mut data = Map::new();
        data.insert("value".to_string(), number_value(result));
        self.state_update(instance, data);
        Ok(true)
    }
}
