pub mod pooled;
pub mod single;

use crate::{
    config::{ConfigErrors, StrategyConfig},
    resolve::{ConfigResolver, ResolvedConfig},
    state::{self, Registry},
    task::{panic_message, TaskContext, TaskFailure, TaskFunction, TaskOutcome, TaskSpec},
};
use std::{
    fmt, fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Invalid execution strategy")]
    Config(#[from] ConfigErrors),
    #[error("Failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Backends the pooled strategy may run its workers on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolBackend {
    /// every task runs in a dedicated child process
    Process,
}

impl FromStr for PoolBackend {
    type Err = ConfigErrors;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_lowercase().as_str() {
            "process" => Ok(Self::Process),
            _ => Err(ConfigErrors::UnsupportedPoolBackend(name.to_string())),
        }
    }
}

impl fmt::Display for PoolBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
        }
    }
}

/// Executes a single task of a chunk and reports its outcome.
///
/// Implementations never fail as a whole, every problem ends up in the outcome of the task.
pub trait TaskRunner: Sync {
    fn run(&self, task: &TaskSpec) -> TaskOutcome;
}

/// The two ways a job can work through its chunk
/// (this is deliberately an enum, the strategy is picked from the job payload)
#[derive(Debug, Clone)]
pub enum Executors {
    Single(single::SingleWorker),
    Pooled(pooled::PooledWorkers),
}

impl Executors {
    /// select the strategy for a job granted `slots` task slots
    pub fn load(strategy: &StrategyConfig, slots: usize) -> Result<Self, ConfigErrors> {
        match strategy {
            StrategyConfig::Single => Ok(Self::Single(single::SingleWorker::new(slots))),
            StrategyConfig::Pooled {
                pool_backend,
                pool_size,
                task_timeout_secs,
            } => {
                let backend = PoolBackend::from_str(pool_backend)?;

                if *pool_size == 0 {
                    return Err(ConfigErrors::InvalidPoolSize);
                }

                if *task_timeout_secs == Some(0) {
                    return Err(ConfigErrors::InvalidTaskTimeout);
                }

                Ok(Self::Pooled(pooled::PooledWorkers::new(
                    backend,
                    *pool_size,
                    *task_timeout_secs,
                )))
            }
        }
    }

    /// run every task of `chunk`, the outcomes follow the order of `chunk`
    pub fn execute<R: TaskRunner>(
        &self,
        chunk: &[TaskSpec],
        runner: &R,
    ) -> Result<Vec<TaskOutcome>, ExecutorError> {
        match self {
            Self::Single(executor) => Ok(executor.execute(chunk, runner)),
            Self::Pooled(executor) => executor.execute(chunk, runner),
        }
    }
}

/// Runs tasks on the current thread of the job
pub struct InProcessRunner<'a> {
    pub base: &'a serde_yaml::Value,
    pub job_id: &'a str,
    pub task_fn: &'a dyn TaskFunction,
    pub resolver: &'a dyn ConfigResolver,
}

impl TaskRunner for InProcessRunner<'_> {
    fn run(&self, task: &TaskSpec) -> TaskOutcome {
        run_task(
            self.base,
            self.job_id,
            task,
            state::restore(&task.state),
            self.task_fn,
            self.resolver,
        )
    }
}

/// The per task contract shared by all strategies: resolve the configuration against the
/// restored registry, inject the job variables, prepare the task directory and call the task.
pub fn run_task(
    base: &serde_yaml::Value,
    job_id: &str,
    task: &TaskSpec,
    registry: Registry,
    task_fn: &dyn TaskFunction,
    resolver: &dyn ConfigResolver,
) -> TaskOutcome {
    let mut config = match resolver.resolve(base, &task.overrides, &registry) {
        Ok(config) => config,
        Err(error) => {
            warn!(index = task.index, error = %error, "Failed to resolve task configuration");

            return TaskOutcome::failed(task.index, TaskFailure::Resolve(error.to_string()));
        }
    };

    // populate new job variables
    config.set_job(job_id, task.index);

    let workdir = match config
        .get(&task.dir_key)
        .and_then(serde_yaml::Value::as_str)
        .map(|dir| PathBuf::from(dir).join(task.index.to_string()))
    {
        Some(workdir) => workdir,
        None => {
            return TaskOutcome::failed(
                task.index,
                TaskFailure::Workdir(format!("'{}' is not set to a path", task.dir_key)),
            )
        }
    };

    if let Err(failure) = prepare_workdir(&workdir, &config, task) {
        return TaskOutcome::failed(task.index, failure);
    }

    debug!(index = task.index, workdir = ?workdir, "Running task");

    let context = TaskContext {
        config,
        registry,
        workdir,
    };

    match panic::catch_unwind(AssertUnwindSafe(|| task_fn.run(&context))) {
        Ok(Ok(value)) => TaskOutcome::completed(task.index, value),
        Ok(Err(failure)) => {
            warn!(index = task.index, "Task failed: {failure}");

            TaskOutcome::failed(task.index, failure)
        }
        Err(payload) => {
            let message = panic_message(payload);
            warn!(index = task.index, "Task panicked: {message}");

            TaskOutcome::failed(task.index, TaskFailure::Panicked(message))
        }
    }
}

/// create the task directory and store the resolved configuration next to the results
fn prepare_workdir(
    workdir: &Path,
    config: &ResolvedConfig,
    task: &TaskSpec,
) -> Result<(), TaskFailure> {
    let to_failure = |error: &dyn fmt::Display| {
        TaskFailure::Workdir(format!("{}: {error}", workdir.to_string_lossy()))
    };

    fs::create_dir_all(workdir).map_err(|error| to_failure(&error))?;

    let config_yaml = serde_yaml::to_string(config).map_err(|error| to_failure(&error))?;
    fs::write(workdir.join("config.yaml"), config_yaml).map_err(|error| to_failure(&error))?;

    let overrides_yaml =
        serde_yaml::to_string(&task.overrides).map_err(|error| to_failure(&error))?;
    fs::write(workdir.join("overrides.yaml"), overrides_yaml).map_err(|error| to_failure(&error))
}
