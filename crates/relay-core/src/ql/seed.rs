use super::pluck::format_row;
use super::{Operator, QlContext, QlEnv, ValueSource, PRIMARY_KEY_FIELD};
use crate::domain::ports::{Condition, ObjectType, RecordQuery};
use crate::CoreError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// One `find` condition; an array value becomes an `IN` match
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FindCondition {
    /// Field ID, or `_PK`
    pub field: String,
    /// Value to match
    pub value: ValueSource,
}

pub(super) fn column_of(object: &ObjectType, field_id: &str) -> Result<String, CoreError> {
    if field_id == PRIMARY_KEY_FIELD {
        return Ok(object.primary_key.clone());
    }
    object
        .field(field_id)
        .map(|f| f.column.clone())
        .ok_or_else(|| {
            CoreError::ConfigurationError(format!(
                "Unknown field {} on object {}",
                field_id, object.id
            ))
        })
}

pub(super) fn condition(column: String, value: Value) -> Condition {
    match value {
        Value::Array(values) => Condition::In { column, values },
        value => Condition::Eq { column, value },
    }
}

pub(super) async fn fetch_rows(
    env: &QlEnv<'_>,
    object: &ObjectType,
    query: &RecordQuery,
) -> Result<Vec<Value>, CoreError> {
    let objects = env.ctx.services.objects.as_ref();
    let tx = env.ctx.transaction.as_ref();
    let rows = env
        .ctx
        .retry()
        .run("ql find", || objects.find(query, tx))
        .await?;
    Ok(rows.into_iter().map(|row| format_row(object, row)).collect())
}

/// Query the active object
#[derive(Debug)]
pub struct Find {
    conditions: Vec<FindCondition>,
}

impl Find {
    /// Create a find operator
    pub fn new(conditions: Vec<FindCondition>) -> Self {
        Self { conditions }
    }
}

#[async_trait]
impl Operator for Find {
    fn label(&self) -> &'static str {
        "find"
    }

    async fn apply(&self, input: QlContext, env: &mut QlEnv<'_>) -> Result<QlContext, CoreError> {
        let object = input.object()?;
        let mut query = RecordQuery::all(&object.id);
        for c in &self.conditions {
            let column = column_of(&object, &c.field)?;
            let value = c.value.resolve(env.instance, env.ctx);
            if value.is_null() {
                return Ok(input.degraded(
                    self.label(),
                    &format!("condition on {} resolved to null", c.field),
                ));
            }
            query = query.with(condition(column, value));
        }
        let rows = fetch_rows(env, &object, &query).await?;
        Ok(input.with_data(self.label(), Value::Array(rows)))
    }
}

/// Take data from prior task output, optionally fetching rows by primary key
#[derive(Debug)]
pub struct Load {
    from: String,
    fetch: bool,
}

impl Load {
    /// Create a load operator
    pub fn new(from: String, fetch: bool) -> Self {
        Self { from, fetch }
    }
}

#[async_trait]
impl Operator for Load {
    fn label(&self) -> &'static str {
        "load"
    }

    async fn apply(&self, input: QlContext, env: &mut QlEnv<'_>) -> Result<QlContext, CoreError> {
        let value = match env.ctx.references.resolve(env.instance, &self.from) {
            Some(Value::Null) | None => {
                return Ok(input.degraded(self.label(), &format!("{} resolved to null", self.from)))
            }
            Some(value) => value,
        };
        if !self.fetch {
            return Ok(input.with_data(self.label(), value));
        }

        let object = input.object()?;
        let ids = match value {
            Value::Array(ids) => ids,
            id => vec![id],
        };
        let query = RecordQuery::all(&object.id).with(Condition::In {
            column: object.primary_key.clone(),
            values: ids,
        });
        let rows = fetch_rows(env, &object, &query).await?;
        Ok(input.with_data(self.label(), Value::Array(rows)))
    }
}
