use crate::domain::ports::ObjectType;
use crate::CoreError;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// The value threaded through a QL pipeline
#[derive(Debug, Clone)]
pub struct QlContext {
    /// Operator that produced this context
    pub label: String,
    /// Active business object
    pub object: Option<Arc<ObjectType>>,
    /// Scalar, row, array of rows, or null
    pub data: Value,
    /// The context this one was derived from
    pub prev: Option<Arc<QlContext>>,
    /// Accumulated diagnostic messages
    pub diagnostics: Vec<String>,
}

impl QlContext {
    /// Seed context over an object, with no data
    pub fn root(object: ObjectType) -> Self {
        Self {
            label: "root".to_string(),
            object: Some(Arc::new(object)),
            data: Value::Null,
            prev: None,
            diagnostics: Vec::new(),
        }
    }

    /// Derive a new context, linking this one as `prev`
    pub fn then(self, label: &str, object: Option<Arc<ObjectType>>, data: Value) -> Self {
        let diagnostics = self.diagnostics.clone();
        Self {
            label: label.to_string(),
            object,
            data,
            prev: Some(Arc::new(self)),
            diagnostics,
        }
    }

    /// Derive a new context over the same object
    pub fn with_data(self, label: &str, data: Value) -> Self {
        let object = self.object.clone();
        self.then(label, object, data)
    }

    /// Derive a null-data context carrying a diagnostic
    pub fn degraded(self, label: &str, message: &str) -> Self {
        warn!(operator = label, "{}", message);
        let mut next = self.with_data(label, Value::Null);
        next.diagnostics.push(format!("{}: {}", label, message));
        next
    }

    /// Record a diagnostic without changing the data
    pub fn note(&mut self, message: String) {
        warn!(operator = %self.label, "{}", message);
        self.diagnostics.push(format!("{}: {}", self.label, message));
    }

    /// Whether there is no data
    #[inline]
    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }

    /// The active object, required by most operators
    pub fn object(&self) -> Result<Arc<ObjectType>, CoreError> {
        self.object.clone().ok_or_else(|| {
            CoreError::ConfigurationError(format!("No active object at {}", self.label))
        })
    }

    /// Operator labels from the root to this context
    pub fn lineage(&self) -> Vec<String> {
        let mut labels = vec![self.label.clone()];
        let mut current = self.prev.as_deref();
        while let Some(ctx) = current {
            labels.push(ctx.label.clone());
            current = ctx.prev.as_deref();
        }
        labels.reverse();
        labels
    }
}
