//!
//! Relay Core - process execution core for the Relay platform
//!
//! This crate runs long-lived, multi-step business processes: it compiles
//! diagram documents into task graphs, drives instances through the engine
//! loop, and provides the task variants and the QL record pipeline tasks
//! use to read and write the object store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - definitions, instances, lanes and ports
pub mod domain;

/// Application services - engine loop and process manager
pub mod application;

/// Task state machine and task variants
pub mod task;

/// QL record pipeline
pub mod ql;

/// Error types
pub mod error;

#[cfg(test)]
mod test_support;

pub use error::CoreError;

pub use application::context::{EngineConfig, RequestContext, RetryPolicy, Services};
pub use application::engine::{EngineLoop, RunReport};
pub use application::graph::{CompiledProcess, TaskGraph};
pub use application::process_manager::{ProcessManager, TriggerOutcome};

pub use domain::definition::{
    DefinitionId, ElementDefinition, ElementKind, ProcessDefinition, ProcessDocument, TaskId,
};
pub use domain::instance::{
    Instance, InstanceId, InstanceKey, InstanceStatus, TaskState, TaskStatus,
};
pub use domain::participant::Lane;
pub use domain::repository::{DefinitionRepository, InstanceRepository};
