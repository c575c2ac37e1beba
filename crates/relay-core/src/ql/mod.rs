//! QL: composable, asynchronous record-transformation pipelines.
//!
//! A pipeline is a list of operators, each an async `QlContext -> QlContext`
//! function. The head seeds a context over one business object; every
//! later operator receives the context left by its predecessor. Operators
//! turn `null` data into a diagnostic instead of an error, so a broken
//! upstream link degrades to "no data".

mod context;
mod pluck;
mod save;
mod seed;
mod update;

pub use context::QlContext;
pub use pluck::{format_row, RowPluck, SetFirst, SetPluck};
pub use save::{Save, SaveKind};
pub use seed::{Find, FindCondition, Load};
pub use update::RowUpdate;

use crate::application::context::RequestContext;
use crate::domain::definition::TaskId;
use crate::domain::instance::Instance;
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Field ID that addresses the primary key directly
pub const PRIMARY_KEY_FIELD: &str = "_PK";

/// What an operator may touch besides its input context
pub struct QlEnv<'a> {
    /// Instance whose state save operators write into
    pub instance: &'a mut Instance,
    /// Task that owns the pipeline
    pub task_id: &'a TaskId,
    /// Request context
    pub ctx: &'a RequestContext,
}

/// One pipeline stage
#[async_trait]
pub trait Operator: Send + Sync + std::fmt::Debug {
    /// Label recorded in the context lineage
    fn label(&self) -> &'static str;

    /// Transform a context
    async fn apply(&self, input: QlContext, env: &mut QlEnv<'_>) -> Result<QlContext, CoreError>;
}

/// A literal or a reference into prior task output
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ValueSource {
    /// `{"ref": "Label.path"}`
    Reference {
        /// Reference expression
        #[serde(rename = "ref")]
        reference: String,
    },
    /// Any other JSON value
    Literal(Value),
}

impl ValueSource {
    /// Resolve to a concrete value; unresolved references become null
    pub fn resolve(&self, instance: &Instance, ctx: &RequestContext) -> Value {
        match self {
            ValueSource::Reference { reference } => {
                ctx.references.resolve(instance, reference).unwrap_or(Value::Null)
            }
            ValueSource::Literal(value) => value.clone(),
        }
    }
}

/// Declarative operator, as found in task config
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperatorSpec {
    /// Query the active object
    Find {
        /// Conjunction of conditions
        #[serde(default)]
        conditions: Vec<FindCondition>,
    },
    /// Take data from prior task output
    Load {
        /// Reference to the data
        from: String,
        /// Treat the data as primary keys and fetch the rows
        #[serde(default)]
        fetch: bool,
    },
    /// Project every row to one field
    SetPluck {
        /// Field ID
        field: String,
    },
    /// Project a single row to one field
    RowPluck {
        /// Field ID
        field: String,
    },
    /// Keep the first element
    SetFirst,
    /// Save a row into task state
    RowSave {
        /// State key
        key: String,
    },
    /// Save the set's leading element into task state
    SetSave {
        /// State key
        key: String,
    },
    /// Save a scalar into task state
    ValueSave {
        /// State key
        key: String,
    },
    /// Update the rows in the context
    RowUpdate {
        /// Field ID -> new value
        updates: BTreeMap<String, ValueSource>,
    },
}

impl OperatorSpec {
    /// Build the operator
    pub fn build(&self) -> Box<dyn Operator> {
        match self {
            OperatorSpec::Find { conditions } => Box::new(Find::new(conditions.clone())),
            OperatorSpec::Load { from, fetch } => Box::new(Load::new(from.clone(), *fetch)),
            OperatorSpec::SetPluck { field } => Box::new(SetPluck::new(field.clone())),
            OperatorSpec::RowPluck { field } => Box::new(RowPluck::new(field.clone())),
            OperatorSpec::SetFirst => Box::new(SetFirst),
            OperatorSpec::RowSave { key } => Box::new(Save::new(SaveKind::Row, key.clone())),
            OperatorSpec::SetSave { key } => Box::new(Save::new(SaveKind::Set, key.clone())),
            OperatorSpec::ValueSave { key } => Box::new(Save::new(SaveKind::Value, key.clone())),
            OperatorSpec::RowUpdate { updates } => Box::new(RowUpdate::new(updates.clone())),
        }
    }
}

/// A root object plus an ordered list of operators
#[derive(Debug)]
pub struct Pipeline {
    object: String,
    operators: Vec<Box<dyn Operator>>,
}

impl Pipeline {
    /// Build from operator specs
    pub fn new(object: impl Into<String>, specs: &[OperatorSpec]) -> Self {
        Self {
            object: object.into(),
            operators: specs.iter().map(OperatorSpec::build).collect(),
        }
    }

    /// Append an operator
    pub fn then(mut self, operator: Box<dyn Operator>) -> Self {
        self.operators.push(operator);
        self
    }

    /// Seed the root context and run every operator in order
    pub async fn run(&self, env: &mut QlEnv<'_>) -> Result<QlContext, CoreError> {
        let object = env
            .ctx
            .services
            .objects
            .object_type(&self.object)
            .await?
            .ok_or_else(|| {
                CoreError::ConfigurationError(format!(
                    "Pipeline of task {} references unknown object {}",
                    env.task_id, self.object
                ))
            })?;

        let mut context = QlContext::root(object);
        for operator in &self.operators {
            context = operator.apply(context, env).await?;
            debug!(
                task_id = %env.task_id,
                operator = operator.label(),
                null = context.is_null(),
                "QL operator applied"
            );
        }
        Ok(context)
    }
}
