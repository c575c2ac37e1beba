use super::{Task, TaskNode};
use crate::application::context::RequestContext;
use crate::domain::definition::ElementKind;
use crate::domain::instance::Instance;
use crate::domain::ports::{Condition, ObjectType, RecordQuery};
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

/// Re-query and broadcast the rows a procedure touched
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Object whose rows are re-read
    pub object: String,
    /// Field on that object linking back to the driving record
    pub field: String,
    /// Broadcast channel for the refreshed rows
    pub channel: String,
}

/// Stored-procedure task configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProcedureConfig {
    /// Driving object ID
    pub object: String,
    /// Field of the driving object matched against `record`
    pub field: String,
    /// Reference to the driving record's key, e.g. `Trigger.batch_id`
    pub record: String,
    /// Procedure name; defaults per task kind
    #[serde(default)]
    pub procedure: Option<String>,
    /// Optional refresh and broadcast
    #[serde(default)]
    pub refresh: Option<RefreshConfig>,
}

/// Batch accounting processing and period close
#[derive(Debug)]
pub struct ProcedureTask {
    node: TaskNode,
    config: ProcedureConfig,
}

impl ProcedureTask {
    /// Create a stored-procedure task
    pub fn new(node: TaskNode, config: ProcedureConfig) -> Self {
        Self { node, config }
    }

    /// The procedure this task invokes
    pub fn procedure(&self) -> &str {
        match (&self.config.procedure, self.node.kind) {
            (Some(name), _) => name,
            (None, ElementKind::PeriodClose) => "close_accounting_period",
            (None, _) => "process_accounting_batch",
        }
    }

    async fn object(&self, ctx: &RequestContext, object_id: &str) -> Result<ObjectType, CoreError> {
        ctx.services
            .objects
            .object_type(object_id)
            .await?
            .ok_or_else(|| {
                CoreError::ConfigurationError(format!(
                    "Task {} references unknown object {}",
                    self.node.id, object_id
                ))
            })
    }

    fn column(&self, object: &ObjectType, field_id: &str) -> Result<String, CoreError> {
        if field_id == "_PK" {
            return Ok(object.primary_key.clone());
        }
        object
            .field(field_id)
            .map(|f| f.column.clone())
            .ok_or_else(|| {
                CoreError::ConfigurationError(format!(
                    "Task {} references unknown field {} on {}",
                    self.node.id, field_id, object.id
                ))
            })
    }
}

#[async_trait]
impl Task for ProcedureTask {
    fn node(&self) -> &TaskNode {
        &self.node
    }

    async fn execute(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<bool, CoreError> {
        // Resolve every configured id before touching the store.
        let object = self.object(ctx, &self.config.object).await?;
        let column = self.column(&object, &self.config.field)?;
        let refresh = match &self.config.refresh {
            Some(refresh) => {
                let target = self.object(ctx, &refresh.object).await?;
                let link = self.column(&target, &refresh.field)?;
                Some((refresh, target, link))
            }
            None => None,
        };

        let key = ctx
            .references
            .resolve(instance, &self.config.record)
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                CoreError::ConfigurationError(format!(
                    "Record reference '{}' resolved to nothing",
                    self.config.record
                ))
            })?;

        let objects = ctx.services.objects.as_ref();
        let tx = ctx.transaction.as_ref();
        let query = RecordQuery::all(&object.id).with(Condition::Eq {
            column,
            value: key.clone(),
        });
        let rows = ctx
            .retry()
            .run("find driving record", || objects.find(&query, tx))
            .await?;
        let record = rows.into_iter().next().ok_or_else(|| {
            CoreError::Other(format!("No {} record matches {}", object.id, key))
        })?;
        let record_id = record
            .get(&object.primary_key)
            .cloned()
            .unwrap_or(Value::Null);

        let procedure = self.procedure().to_string();
        let args = [record_id.clone()];
        let result = match ctx
            .retry()
            .run("call procedure", || objects.call_procedure(&procedure, &args, tx))
            .await
        {
            Ok(result) => result,
            Err(err) if err.is_already_exists() => {
                info!(task_id = %self.node.id, procedure = %procedure, "Procedure already applied");
                json!({ "alreadyApplied": true })
            }
            Err(err) => return Err(err),
        };
        self.log(instance, &format!("Called {}({})", procedure, record_id));

        if let Some((refresh, target, link)) = refresh {
            let query = RecordQuery::all(&target.id).with(Condition::Eq {
                column: link,
                value: record_id.clone(),
            });
            let rows = ctx
                .retry()
                .run("refresh affected rows", || objects.find(&query, tx))
                .await?;
            ctx.services
                .broadcaster
                .broadcast(
                    &refresh.channel,
                    json!({ "object": target.id, "rows": rows }),
                )
                .await?;
        }

        let mut data = Map::new();
        data.insert("procedure".to_string(), Value::String(procedure));
        data.insert("record_id".to_string(), record_id);
        data.insert("result".to_string(), result);
        self.state_update(instance, data);
        Ok(true)
    }
}
