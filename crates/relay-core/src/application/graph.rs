//! Compiled task graph for one scope of a definition.

use crate::domain::definition::{ProcessDefinition, TaskId};
use crate::domain::reference::References;
use crate::task::{build_task, Task};
use crate::CoreError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Tasks and connections of one scope (top level or one sub-process)
#[derive(Debug, Clone)]
pub struct TaskGraph {
    start: TaskId,
    tasks: Vec<Arc<dyn Task>>,
    index: HashMap<TaskId, usize>,
    /// Forward edges only; back edges never gate readiness
    predecessors: HashMap<TaskId, Vec<TaskId>>,
    /// Every outgoing edge, back edges included
    successors: HashMap<TaskId, Vec<TaskId>>,
    back_edges: HashSet<(TaskId, TaskId)>,
}

impl TaskGraph {
    /// Start building a graph by hand
    pub fn builder() -> TaskGraphBuilder {
        TaskGraphBuilder::default()
    }

    /// Compile the tasks and connections of one scope
    pub fn compile(definition: &ProcessDefinition, scope: Option<&str>) -> Result<Self, CoreError> {
        let start = definition.start_of(scope).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Scope {} has no start element",
                scope.unwrap_or("<top>")
            ))
        })?;

        let mut builder = Self::builder().start(&start.id);
        let mut members = HashSet::new();
        for element in definition.elements_in(scope) {
            members.insert(element.id.as_str());
            builder = builder.task(build_task(element, definition)?);
        }
        for connection in &definition.document.connections {
            if members.contains(connection.from.as_str()) {
                builder = builder.connect(&connection.from, &connection.to);
            }
        }
        builder.build()
    }

    /// The scope's start task
    pub fn start(&self) -> &TaskId {
        &self.start
    }

    /// Tasks in declaration order
    pub fn tasks(&self) -> &[Arc<dyn Task>] {
        &self.tasks
    }

    /// Find a task by ID
    pub fn task(&self, id: &TaskId) -> Option<&Arc<dyn Task>> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Whether a task belongs to this scope
    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Forward predecessors of a task
    pub fn predecessors(&self, id: &TaskId) -> &[TaskId] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All successors of a task
    pub fn successors(&self, id: &TaskId) -> &[TaskId] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `from -> to` closes a cycle
    pub fn is_back_edge(&self, from: &TaskId, to: &TaskId) -> bool {
        self.back_edges.contains(&(from.clone(), to.clone()))
    }
}

/// Builder for [`TaskGraph`]
#[derive(Default)]
pub struct TaskGraphBuilder {
    start: Option<TaskId>,
    tasks: Vec<Arc<dyn Task>>,
    edges: Vec<(TaskId, TaskId)>,
}

impl TaskGraphBuilder {
    /// Set the start task
    pub fn start(mut self, id: &str) -> Self {
        self.start = Some(TaskId::new(id));
        self
    }

    /// Add a task
    pub fn task(mut self, task: Arc<dyn Task>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Add a directed connection
    pub fn connect(mut self, from: &str, to: &str) -> Self {
        self.edges.push((TaskId::new(from), TaskId::new(to)));
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<TaskGraph, CoreError> {
        let mut index = HashMap::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            if index.insert(task.id().clone(), i).is_some() {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate task ID: {}",
                    task.id()
                )));
            }
        }

        let start = self
            .start
            .ok_or_else(|| CoreError::ValidationError("Graph has no start task".to_string()))?;
        if !index.contains_key(&start) {
            return Err(CoreError::TaskNotFound(start.0));
        }

        let mut successors: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for (from, to) in &self.edges {
            for id in [from, to] {
                if !index.contains_key(id) {
                    return Err(CoreError::TaskNotFound(id.0.clone()));
                }
            }
            successors.entry(from.clone()).or_default().push(to.clone());
        }

        let back_edges = find_back_edges(&start, &successors);
        let mut predecessors: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for (from, to) in &self.edges {
            if !back_edges.contains(&(from.clone(), to.clone())) {
                predecessors.entry(to.clone()).or_default().push(from.clone());
            }
        }

        Ok(TaskGraph {
            start,
            tasks: self.tasks,
            index,
            predecessors,
            successors,
            back_edges,
        })
    }
}

/// Edges that point at a task still on the DFS stack
fn find_back_edges(
    start: &TaskId,
    successors: &HashMap<TaskId, Vec<TaskId>>,
) -> HashSet<(TaskId, TaskId)> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        OnStack,
        Done,
    }

    let mut marks: HashMap<&TaskId, Mark> = HashMap::new();
    let mut back = HashSet::new();
    // (node, next child index)
    let mut stack: Vec<(&TaskId, usize)> = vec![(start, 0)];
    marks.insert(start, Mark::OnStack);

    while let Some((node, child)) = stack.last_mut() {
        let children = successors.get(*node).map(Vec::as_slice).unwrap_or(&[]);
        if let Some(next) = children.get(*child) {
            *child += 1;
            let from = *node;
            match marks.get(next) {
                Some(Mark::OnStack) => {
                    back.insert((from.clone(), next.clone()));
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(next, Mark::OnStack);
                    stack.push((next, 0));
                }
            }
        } else {
            marks.insert(*node, Mark::Done);
            stack.pop();
        }
    }
    back
}

/// A definition compiled down to its top-level graph
#[derive(Debug, Clone)]
pub struct CompiledProcess {
    /// The definition
    pub definition: Arc<ProcessDefinition>,
    /// Top-level task graph
    pub graph: Arc<TaskGraph>,
    /// Label index for references
    pub references: References,
}

impl CompiledProcess {
    /// Build the executable graph of a definition
    pub fn new(definition: ProcessDefinition) -> Result<Self, CoreError> {
        let graph = TaskGraph::compile(&definition, None)?;
        let references = References::new(definition.labels());
        Ok(Self {
            definition: Arc::new(definition),
            graph: Arc::new(graph),
            references,
        })
    }
}
