use super::seed::fetch_rows;
use super::{Operator, QlContext, QlEnv, PRIMARY_KEY_FIELD};
use crate::domain::ports::{Condition, ConnectionDef, FieldKind, ObjectType, RecordQuery};
use crate::task::formula::{evaluate, number_value};
use crate::CoreError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

static COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid column pattern"));

/// Fill in every formula field of a row from the row's own columns
pub fn format_row(object: &ObjectType, mut row: Value) -> Value {
    let formulas: Vec<(String, String)> = object
        .fields
        .iter()
        .filter_map(|f| match &f.kind {
            FieldKind::Formula { expression } => Some((f.column.clone(), expression.clone())),
            _ => None,
        })
        .collect();
    if formulas.is_empty() {
        return row;
    }

    for (column, expression) in formulas {
        let expanded = COLUMN.replace_all(&expression, |caps: &regex::Captures<'_>| {
            match row.get(&caps[1]) {
                Some(Value::Number(n)) => format!("({})", n),
                Some(Value::String(s)) => format!("({})", s),
                _ => "null".to_string(),
            }
        });
        let value = match evaluate(&expanded) {
            Ok(n) => number_value(n),
            Err(err) => {
                warn!(object = %object.id, column = %column, error = %err, "Formula field left empty");
                Value::Null
            }
        };
        if let Value::Object(map) = &mut row {
            map.insert(column, value);
        }
    }
    row
}

/// Project every row of an array context to one field.
///
/// A connection field fans out: the related ids of all rows are collected,
/// de-duplicated, and fetched in one query against the related object.
#[derive(Debug)]
pub struct SetPluck {
    field: String,
}

impl SetPluck {
    /// Create a set-pluck operator
    pub fn new(field: String) -> Self {
        Self { field }
    }

    async fn fan_out(
        &self,
        input: QlContext,
        rows: &[Value],
        column: &str,
        connection: &ConnectionDef,
        env: &QlEnv<'_>,
    ) -> Result<QlContext, CoreError> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for row in rows {
            let linked = match row.get(column) {
                Some(Value::Array(values)) => values.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(value) => vec![value.clone()],
            };
            for id in linked {
                if !id.is_null() && seen.insert(id.to_string()) {
                    ids.push(id);
                }
            }
        }

        let related = env
            .ctx
            .services
            .objects
            .object_type(&connection.object)
            .await?
            .ok_or_else(|| {
                CoreError::ConfigurationError(format!(
                    "Field {} links to unknown object {}",
                    self.field, connection.object
                ))
            })?;
        if ids.is_empty() {
            return Ok(input.then(self.label(), Some(Arc::new(related)), Value::Array(Vec::new())));
        }

        let mut query = RecordQuery::all(&related.id).with(Condition::In {
            column: related.primary_key.clone(),
            values: ids,
        });
        for index in &connection.index_fields {
            query = query.with(Condition::Eq {
                column: index.column.clone(),
                value: index.value.clone(),
            });
        }
        let related_rows = fetch_rows(env, &related, &query).await?;
        Ok(input.then(
            self.label(),
            Some(Arc::new(related)),
            Value::Array(related_rows),
        ))
    }
}

#[async_trait]
impl Operator for SetPluck {
    fn label(&self) -> &'static str {
        "set_pluck"
    }

    async fn apply(&self, input: QlContext, env: &mut QlEnv<'_>) -> Result<QlContext, CoreError> {
        let rows = match &input.data {
            Value::Null => return Ok(input.degraded(self.label(), "no data to pluck")),
            Value::Array(rows) => rows.clone(),
            _ => {
                return Err(CoreError::DataShapeError(format!(
                    "set_pluck of {} requires an array",
                    self.field
                )))
            }
        };
        let object = input.object()?;

        if self.field == PRIMARY_KEY_FIELD {
            let keys = rows
                .iter()
                .map(|row| row.get(&object.primary_key).cloned().unwrap_or(Value::Null))
                .collect();
            return Ok(input.with_data(self.label(), Value::Array(keys)));
        }

        let field = object.field(&self.field).ok_or_else(|| {
            CoreError::ConfigurationError(format!(
                "Unknown field {} on object {}",
                self.field, object.id
            ))
        })?;

        match &field.kind {
            FieldKind::Connection(connection) => {
                self.fan_out(input, &rows, &field.column, connection, env)
                    .await
            }
            FieldKind::Formula { .. } => {
                let values = rows
                    .into_iter()
                    .map(|row| {
                        format_row(&object, row)
                            .get(&field.column)
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                Ok(input.with_data(self.label(), Value::Array(values)))
            }
            FieldKind::Value => {
                let values = rows
                    .iter()
                    .map(|row| row.get(&field.column).cloned().unwrap_or(Value::Null))
                    .collect();
                Ok(input.with_data(self.label(), Value::Array(values)))
            }
        }
    }
}

/// Project a single row to one field.
///
/// The result is a scalar unless the field is a to-many connection. Extra
/// matches for a to-one field are logged and dropped.
#[derive(Debug)]
pub struct RowPluck {
    inner: SetPluck,
}

impl RowPluck {
    /// Create a row-pluck operator
    pub fn new(field: String) -> Self {
        Self {
            inner: SetPluck::new(field),
        }
    }

    fn is_many(&self, object: &ObjectType) -> bool {
        object
            .field(&self.inner.field)
            .and_then(|f| f.connection())
            .map_or(false, |c| c.many)
    }
}

#[async_trait]
impl Operator for RowPluck {
    fn label(&self) -> &'static str {
        "row_pluck"
    }

    async fn apply(&self, mut input: QlContext, env: &mut QlEnv<'_>) -> Result<QlContext, CoreError> {
        match &input.data {
            Value::Null => return Ok(input.degraded(self.label(), "no row to pluck")),
            Value::Array(_) => {}
            _ => {
                let row = input.data.take();
                input.data = Value::Array(vec![row]);
            }
        }
        let many = self.is_many(input.object()?.as_ref());

        let mut output = self.inner.apply(input, env).await?;
        output.label = self.label().to_string();
        if many || output.is_null() {
            return Ok(output);
        }

        let mut values = match output.data.take() {
            Value::Array(values) => values,
            other => vec![other],
        };
        if values.len() > 1 {
            output.note(format!(
                "{} values for single-valued field {}, keeping the first",
                values.len(),
                self.inner.field
            ));
        }
        output.data = if values.is_empty() {
            Value::Null
        } else {
            values.swap_remove(0)
        };
        Ok(output)
    }
}

/// Reduce an array context to its first element
#[derive(Debug)]
pub struct SetFirst;

#[async_trait]
impl Operator for SetFirst {
    fn label(&self) -> &'static str {
        "set_first"
    }

    async fn apply(&self, input: QlContext, _env: &mut QlEnv<'_>) -> Result<QlContext, CoreError> {
        match &input.data {
            Value::Null => Ok(input.degraded(self.label(), "no data")),
            Value::Array(items) => {
                let first = items.first().cloned().unwrap_or(Value::Null);
                Ok(input.with_data(self.label(), first))
            }
            _ => Err(CoreError::DataShapeError(
                "set_first requires an array".to_string(),
            )),
        }
    }
}
