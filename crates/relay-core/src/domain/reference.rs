//! Resolution of `Label.path` references into prior task output.
//!
//! A reference names a task by label or id, followed by an optional dotted
//! path into that task's state data. Both `Label.amount` and
//! `{Label}.amount` spellings are accepted. A bare label resolves to the
//! task's `value` entry when it has one, otherwise to all of its data.

use crate::domain::definition::TaskId;
use crate::domain::instance::Instance;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// `{Label}` or `{Label.path}` followed by an optional `.path` tail
static BRACED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([^{}]+)\}((?:\.[A-Za-z_][A-Za-z0-9_]*)*)").expect("valid reference pattern")
});

/// Label index shared by every task of one compiled definition
#[derive(Debug, Clone, Default)]
pub struct References {
    labels: Arc<HashMap<String, TaskId>>,
}

impl References {
    /// Build from a label -> task ID map
    pub fn new(labels: HashMap<String, TaskId>) -> Self {
        Self {
            labels: Arc::new(labels),
        }
    }

    /// Task ID for a label or id
    pub fn task_for(&self, label: &str) -> Option<&TaskId> {
        self.labels.get(label.trim())
    }

    /// Resolve a reference against an instance's state map
    pub fn resolve(&self, instance: &Instance, reference: &str) -> Option<Value> {
        let normalized = normalize(reference);
        let mut segments = normalized.split('.');
        let label = segments.next()?;
        let task_id = self.task_for(label)?;
        let state = instance.state_of(task_id)?;
        let path: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();

        if path.is_empty() {
            return Some(
                state
                    .get("value")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(state.data.clone())),
            );
        }

        let (first, rest) = path.split_first()?;
        let root = state.get(first)?;
        lookup_path(root, rest).cloned()
    }

    /// Replace every `{Label}.path` placeholder in `text` using `render`
    pub fn substitute<F>(&self, instance: &Instance, text: &str, mut render: F) -> String
    where
        F: FnMut(&str, Option<Value>) -> String,
    {
        BRACED
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let reference = format!("{}{}", &caps[1], &caps[2]);
                let value = self.resolve(instance, &reference);
                render(&reference, value)
            })
            .into_owned()
    }
}

/// `{Label}.a.b` and `{Label.a}.b` both become `Label.a.b`
fn normalize(reference: &str) -> String {
    reference
        .trim()
        .chars()
        .filter(|c| *c != '{' && *c != '}')
        .collect()
}

/// Walk a dotted path into a JSON value; numeric segments index arrays
pub fn lookup_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
