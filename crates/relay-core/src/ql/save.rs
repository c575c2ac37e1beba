use super::{Operator, QlContext, QlEnv};
use crate::CoreError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

/// Shape a save operator expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    /// A single row object
    Row,
    /// Any value; arrays keep their leading element
    Set,
    /// A scalar
    Value,
}

/// Write the context data into the owning task's state under `key`.
///
/// Arrays are reduced to their first element for every kind. The context is
/// passed through unchanged; null data or an empty array degrades instead.
#[derive(Debug)]
pub struct Save {
    kind: SaveKind,
    key: String,
}

impl Save {
    /// Create a save operator
    pub fn new(kind: SaveKind, key: String) -> Self {
        Self { kind, key }
    }
}

#[async_trait]
impl Operator for Save {
    fn label(&self) -> &'static str {
        match self.kind {
            SaveKind::Row => "row_save",
            SaveKind::Set => "set_save",
            SaveKind::Value => "value_save",
        }
    }

    async fn apply(&self, input: QlContext, env: &mut QlEnv<'_>) -> Result<QlContext, CoreError> {
        let value = match &input.data {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        // An empty result set saves nothing, like null data
        if value.is_null() {
            return Ok(input.degraded(self.label(), &format!("nothing to save as {}", self.key)));
        }

        match (self.kind, &value) {
            (SaveKind::Row, Value::Object(_)) | (SaveKind::Set, _) => {}
            (SaveKind::Value, v) if !v.is_object() && !v.is_array() => {}
            (kind, _) => {
                return Err(CoreError::DataShapeError(format!(
                    "{:?} save of {} got an incompatible value",
                    kind, self.key
                )))
            }
        }

        let mut data = Map::new();
        data.insert(self.key.clone(), value);
        env.instance.state_update(env.task_id, data);
        debug!(task_id = %env.task_id, key = %self.key, "QL value saved");

        let data = input.data.clone();
        Ok(input.with_data(self.label(), data))
    }
}
