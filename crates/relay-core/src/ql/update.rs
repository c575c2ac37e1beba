use super::pluck::format_row;
use super::seed::column_of;
use super::{Operator, QlContext, QlEnv, ValueSource};
use crate::CoreError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::info;

/// Update every row in the context with the same field values.
///
/// Rows are written through the object store in batches of
/// `update_concurrency`; the context then holds the updated rows in input
/// order.
#[derive(Debug)]
pub struct RowUpdate {
    updates: BTreeMap<String, ValueSource>,
}

impl RowUpdate {
    /// Create a row-update operator from field ID -> value
    pub fn new(updates: BTreeMap<String, ValueSource>) -> Self {
        Self { updates }
    }
}

#[async_trait]
impl Operator for RowUpdate {
    fn label(&self) -> &'static str {
        "row_update"
    }

    async fn apply(&self, input: QlContext, env: &mut QlEnv<'_>) -> Result<QlContext, CoreError> {
        let (rows, single) = match &input.data {
            Value::Null => return Ok(input.degraded(self.label(), "no rows to update")),
            Value::Array(rows) => (rows.clone(), false),
            row => (vec![row.clone()], true),
        };
        let object = input.object()?;

        let mut values = Map::new();
        for (field, source) in &self.updates {
            let column = column_of(&object, field)?;
            values.insert(column, source.resolve(env.instance, env.ctx));
        }

        let keys = rows
            .iter()
            .map(|row| match row.get(&object.primary_key) {
                Some(id) if !id.is_null() => Ok(id.clone()),
                _ => Err(CoreError::DataShapeError(format!(
                    "row_update on {} got a row without {}",
                    object.id, object.primary_key
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let objects = env.ctx.services.objects.as_ref();
        let tx = env.ctx.transaction.as_ref();
        let retry = env.ctx.retry();
        let object_id = object.id.as_str();
        let values = &values;
        let updated: Vec<Value> = stream::iter(keys)
            .map(|id| async move {
                retry
                    .run("ql update", || objects.update(object_id, &id, values, tx))
                    .await
            })
            .buffered(env.ctx.config.update_concurrency.max(1))
            .try_collect()
            .await?;
        info!(task_id = %env.task_id, object = %object.id, rows = updated.len(), "Rows updated");

        let mut updated: Vec<Value> = updated
            .into_iter()
            .map(|row| format_row(&object, row))
            .collect();
        let data = if single {
            updated.pop().unwrap_or(Value::Null)
        } else {
            Value::Array(updated)
        };
        Ok(input.with_data(self.label(), data))
    }
}
