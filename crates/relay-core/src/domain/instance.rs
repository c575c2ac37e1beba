use crate::domain::definition::{DefinitionId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Value object: Instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: caller-supplied deduplication token for instance creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey(pub String);

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Never run, or reset for re-entry
    #[default]
    NotStarted,
    /// Started and suspended pending an external event
    Waiting,
    /// Finished successfully
    Completed,
    /// Failed; the branch does not progress past this task
    Error,
}

/// A line in a task's own log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was written
    pub at: DateTime<Utc>,
    /// Message
    pub message: String,
}

/// Per-task record within an instance's state map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Status
    pub status: TaskStatus,
    /// Task-owned data, referenced by later tasks as `taskId.key`
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Task log
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl TaskState {
    /// Data value under a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Whether the task completed
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Derived instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created or has runnable tasks
    Running,
    /// Every remaining task is suspended on an external event
    Waiting,
    /// Every top-level task completed
    Completed,
    /// At least one branch halted on an error
    Failed,
}

/// Aggregate: one execution of a process definition
///
/// The state map is only mutated through the typed accessors below; each
/// mutation bumps `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier
    pub id: InstanceId,

    /// Definition this instance executes
    pub definition_id: DefinitionId,

    /// Deduplication key, unique across instances
    pub instance_key: InstanceKey,

    /// Context bag built by the trigger
    pub context: Value,

    /// Derived status after the last loop pass
    pub status: InstanceStatus,

    /// Per-task state keyed by task ID
    state: HashMap<TaskId, TaskState>,

    /// State map version
    version: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// Create a new instance
    pub fn new(definition_id: DefinitionId, instance_key: InstanceKey, context: Value) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId(Uuid::new_v4().to_string()),
            definition_id,
            instance_key,
            context,
            status: InstanceStatus::Running,
            state: HashMap::with_capacity(16),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// State map version
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Snapshot of a task's state (default when never referenced)
    pub fn task_state(&self, task_id: &TaskId) -> TaskState {
        self.state.get(task_id).cloned().unwrap_or_default()
    }

    /// Borrow a task's state if it exists
    pub fn state_of(&self, task_id: &TaskId) -> Option<&TaskState> {
        self.state.get(task_id)
    }

    /// Status of a task
    pub fn status_of(&self, task_id: &TaskId) -> TaskStatus {
        self.state
            .get(task_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Iterate over every task state
    pub fn states(&self) -> impl Iterator<Item = (&TaskId, &TaskState)> {
        self.state.iter()
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    fn entry(&mut self, task_id: &TaskId) -> &mut TaskState {
        self.state.entry(task_id.clone()).or_default()
    }

    /// Merge partial data into a task's state
    pub fn state_update(&mut self, task_id: &TaskId, partial: Map<String, Value>) {
        let state = self.entry(task_id);
        for (key, value) in partial {
            state.data.insert(key, value);
        }
        self.touch();
    }

    /// Mark a task as started and suspended
    pub fn state_waiting(&mut self, task_id: &TaskId) {
        self.entry(task_id).status = TaskStatus::Waiting;
        self.touch();
    }

    /// Mark a task as completed
    pub fn state_completed(&mut self, task_id: &TaskId) {
        self.entry(task_id).status = TaskStatus::Completed;
        self.touch();
    }

    /// Mark a task as failed
    pub fn state_error(&mut self, task_id: &TaskId, error: &str) {
        let state = self.entry(task_id);
        state.status = TaskStatus::Error;
        state
            .data
            .insert("_error".to_string(), Value::String(error.to_string()));
        self.touch();
    }

    /// Return a task to not-started so it can run again. Data and log are kept.
    pub fn reset(&mut self, task_id: &TaskId) {
        if let Some(state) = self.state.get_mut(task_id) {
            state.status = TaskStatus::NotStarted;
            state.data.remove("_error");
            self.touch();
        }
    }

    /// Drop a task's data entirely, keeping the log
    pub fn clear_data(&mut self, task_id: &TaskId) {
        if let Some(state) = self.state.get_mut(task_id) {
            state.data.clear();
            self.touch();
        }
    }

    /// Append to a task's log
    pub fn log(&mut self, task_id: &TaskId, message: impl Into<String>) {
        self.entry(task_id).log.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
        self.touch();
    }
}
