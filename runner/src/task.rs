use crate::{
    resolve::ResolvedConfig,
    state::{CapturedState, Registry},
};
use serde::{Deserialize, Serialize};
use std::{any::Any, path::PathBuf};
use thiserror::Error;

/// One unit of work of a sweep, everything a remote job needs to rebuild the task
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub overrides: Vec<String>,
    // dotted key of the resolved config holding the result directory
    pub dir_key: String,
    // global position in the sweep, decides the final ordering
    pub index: usize,
    pub job_id: String,
    pub state: CapturedState,
}

#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum TaskFailure {
    #[error("Task returned an error: {0}")]
    Error(String),
    #[error("Task panicked: {0}")]
    Panicked(String),
    #[error("Failed to resolve task configuration: {0}")]
    Resolve(String),
    #[error("Failed to prepare task directory: {0}")]
    Workdir(String),
    #[error("Worker process failed: {0}")]
    Worker(String),
    #[error("Worker exceeded its timeout of {0}s")]
    Timeout(u64),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
// adjacently tagged, serde_yaml refuses to serialize an enum directly inside another enum
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Completed(serde_yaml::Value),
    Failed(TaskFailure),
}

/// result of a single task, tagged with the global index of the task
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskOutcome {
    pub index: usize,
    pub outcome: Outcome,
}

impl TaskOutcome {
    pub fn completed(index: usize, value: serde_yaml::Value) -> Self {
        Self {
            index,
            outcome: Outcome::Completed(value),
        }
    }

    pub fn failed(index: usize, failure: TaskFailure) -> Self {
        Self {
            index,
            outcome: Outcome::Failed(failure),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Completed(_))
    }

    pub fn value(&self) -> Option<&serde_yaml::Value> {
        match &self.outcome {
            Outcome::Completed(value) => Some(value),
            Outcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match &self.outcome {
            Outcome::Completed(_) => None,
            Outcome::Failed(failure) => Some(failure),
        }
    }
}

/// Everything a task function gets to see once its configuration is resolved.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub config: ResolvedConfig,
    /// private copy of the registry captured when the task was submitted
    pub registry: Registry,
    /// `<result directory>/<index>`, created before the task runs
    pub workdir: PathBuf,
}

/// The user supplied function executed once per task.
///
/// Implemented for every `Fn(&TaskContext) -> Result<serde_yaml::Value, TaskFailure>`, closures
/// need an annotated argument type (`|context: &TaskContext| ...`).
pub trait TaskFunction: Send + Sync {
    fn run(&self, context: &TaskContext) -> Result<serde_yaml::Value, TaskFailure>;
}

impl<F> TaskFunction for F
where
    F: Fn(&TaskContext) -> Result<serde_yaml::Value, TaskFailure> + Send + Sync,
{
    fn run(&self, context: &TaskContext) -> Result<serde_yaml::Value, TaskFailure> {
        self(context)
    }
}

/// best effort extraction of a panic message
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}
