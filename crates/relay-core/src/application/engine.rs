//! The engine loop: discover ready tasks, execute them, propagate readiness.

use crate::application::context::RequestContext;
use crate::application::graph::TaskGraph;
use crate::domain::definition::TaskId;
use crate::domain::instance::{Instance, InstanceStatus, TaskStatus};
use crate::domain::repository::InstanceRepository;
use crate::task::Task;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Outcome of one engine run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Passes that executed at least one task
    pub passes: usize,
    /// Tasks completed during the run, in execution order
    pub completed: Vec<TaskId>,
    /// Tasks that suspended on an external event
    pub waiting: Vec<TaskId>,
    /// Tasks that failed
    pub errored: Vec<TaskId>,
    /// The pass budget ran out before the graph quiesced
    pub exhausted: bool,
}

/// Drives one graph scope of an instance to quiescence.
///
/// The same loop runs the top level and every sub-process scope; only the
/// top level checkpoints and derives the instance status.
pub struct EngineLoop<'g> {
    graph: &'g TaskGraph,
    top_level: bool,
    checkpoints: Option<Arc<dyn InstanceRepository>>,
    persisted_version: u64,
}

impl<'g> EngineLoop<'g> {
    /// Loop over the top-level graph
    pub fn new(graph: &'g TaskGraph) -> Self {
        Self {
            graph,
            top_level: true,
            checkpoints: None,
            persisted_version: 0,
        }
    }

    /// Loop over a sub-process scope
    pub fn nested(graph: &'g TaskGraph) -> Self {
        Self {
            graph,
            top_level: false,
            checkpoints: None,
            persisted_version: 0,
        }
    }

    /// Save the instance after every pass and once more when the run ends.
    ///
    /// `persisted_version` is the version the repository currently holds.
    pub fn with_checkpoints(
        mut self,
        repository: Arc<dyn InstanceRepository>,
        persisted_version: u64,
    ) -> Self {
        self.checkpoints = Some(repository);
        self.persisted_version = persisted_version;
        self
    }

    /// Whether a task may run now: not finished and every forward predecessor completed
    pub fn is_ready(&self, instance: &Instance, id: &TaskId) -> bool {
        match instance.status_of(id) {
            TaskStatus::Completed | TaskStatus::Error => false,
            TaskStatus::NotStarted | TaskStatus::Waiting => self
                .graph
                .predecessors(id)
                .iter()
                .all(|p| instance.status_of(p) == TaskStatus::Completed),
        }
    }

    /// Ready tasks, minus those already suspended during this run
    pub fn pending_tasks(&self, instance: &Instance, suspended: &HashSet<TaskId>) -> Vec<Arc<dyn Task>> {
        self.graph
            .tasks()
            .iter()
            .filter(|t| !suspended.contains(t.id()) && self.is_ready(instance, t.id()))
            .cloned()
            .collect()
    }

    /// Run until no pending tasks remain
    pub async fn run(&self, instance: &mut Instance, ctx: &RequestContext) -> Result<RunReport, CoreError> {
        let mut report = RunReport::default();
        let mut suspended = HashSet::new();
        let mut persisted = self.persisted_version;

        loop {
            let pending = self.pending_tasks(instance, &suspended);
            if pending.is_empty() {
                break;
            }
            if report.passes >= ctx.config.max_passes {
                error!(
                    instance_id = %instance.id,
                    passes = report.passes,
                    "Pass budget exhausted, halting run"
                );
                report.exhausted = true;
                break;
            }
            report.passes += 1;

            for task in pending {
                // An earlier task in this pass may have changed readiness.
                if suspended.contains(task.id()) || !self.is_ready(instance, task.id()) {
                    continue;
                }
                self.step(task.as_ref(), instance, ctx, &mut suspended, &mut report)
                    .await;
            }

            if self.top_level {
                if let Some(repository) = &self.checkpoints {
                    repository.save(instance, persisted).await?;
                    persisted = instance.version();
                }
            }
        }

        if self.top_level {
            instance.status = self.derive_status(instance, &report);
            info!(
                instance_id = %instance.id,
                status = ?instance.status,
                passes = report.passes,
                completed = report.completed.len(),
                waiting = report.waiting.len(),
                errored = report.errored.len(),
                "Engine run finished"
            );
            if let Some(repository) = &self.checkpoints {
                repository.save(instance, persisted).await?;
            }
        }
        Ok(report)
    }

    async fn step(
        &self,
        task: &dyn Task,
        instance: &mut Instance,
        ctx: &RequestContext,
        suspended: &mut HashSet<TaskId>,
        report: &mut RunReport,
    ) {
        let id = task.id().clone();
        debug!(instance_id = %instance.id, task_id = %id, "Executing task");

        match task.execute(instance, ctx).await {
            Ok(true) => {
                task.state_completed(instance);
                for next in task.next_tasks(self.graph) {
                    if let Some(successor) = self.graph.task(next) {
                        successor.reset(instance);
                    }
                }
                report.completed.push(id);
            }
            Ok(false) => {
                instance.state_waiting(&id);
                debug!(instance_id = %instance.id, task_id = %id, "Task waiting");
                suspended.insert(id.clone());
                report.waiting.push(id);
            }
            Err(err) => {
                task.on_error(instance, ctx, &err).await;
                report.errored.push(id);
            }
        }
    }

    fn derive_status(&self, instance: &Instance, report: &RunReport) -> InstanceStatus {
        let statuses: Vec<TaskStatus> = self
            .graph
            .tasks()
            .iter()
            .map(|t| instance.status_of(t.id()))
            .collect();

        if report.exhausted || statuses.contains(&TaskStatus::Error) {
            InstanceStatus::Failed
        } else if statuses.contains(&TaskStatus::Waiting) {
            InstanceStatus::Waiting
        } else {
            InstanceStatus::Completed
        }
    }
}
