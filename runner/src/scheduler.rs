pub mod local;
#[cfg(feature = "slurm")]
pub mod slurm;

use crate::{
    config::{supported_executors, ConfigErrors, LauncherConfig, ResourceParams},
    dispatcher::{ChunkRunner, JobPayload},
    task::TaskOutcome,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to submit jobs: {0}")]
    Submit(String),
    #[error("Job {job} panicked: {reason}")]
    JobPanicked { job: String, reason: String },
    #[error("Job {job} failed: {reason}")]
    JobFailed { job: String, reason: String },
    #[error("Job {0} finished without producing results")]
    MissingResult(String),
    #[error("Scheduler command failed: {0}")]
    Command(String),
    #[error("Scheduler i/o failed")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize job data")]
    Serde(#[from] serde_yaml::Error),
}

/// A submitted job, consumed by waiting for its outcomes
pub trait JobHandle {
    fn job_id(&self) -> &str;

    /// block until the job is done and return the outcomes of its chunk in chunk order
    fn result(self) -> Result<Vec<TaskOutcome>, SchedulerError>;
}

/// The cluster side of a sweep
pub trait Scheduler {
    type Handle: JobHandle;

    fn name(&self) -> &'static str;

    fn configure(&mut self, params: ResourceParams) -> Result<(), SchedulerError>;

    /// Submit one job per payload, the handles follow the order of `jobs`.
    /// A scheduler may report `None` for a job it could not track.
    fn submit_array(
        &mut self,
        jobs: Vec<JobPayload>,
    ) -> Result<Vec<Option<Self::Handle>>, SchedulerError>;
}

/// All scheduler backends selectable from the configuration
pub enum Schedulers {
    Local(local::LocalScheduler),
    #[cfg(feature = "slurm")]
    Slurm(slurm::SlurmScheduler),
}

pub enum Handles {
    Local(local::LocalHandle),
    #[cfg(feature = "slurm")]
    Slurm(slurm::SlurmHandle),
}

impl Schedulers {
    /// Build the backend named in `config.executor`, jobs of the local backend are run by `runner`
    pub fn load(config: &LauncherConfig, runner: Arc<dyn ChunkRunner>) -> Result<Self, ConfigErrors> {
        match config.executor.as_str() {
            "local" => Ok(Self::Local(local::LocalScheduler::new(runner))),
            #[cfg(feature = "slurm")]
            "slurm" => Ok(Self::Slurm(
                slurm::SlurmScheduler::new(
                    config.output_folder.clone(),
                    std::env::current_exe()?,
                    config.max_num_timeout,
                )
                .with_poll_interval(std::time::Duration::from_secs(
                    config.poll_interval_secs.max(1),
                )),
            )),
            name => {
                error!(
                    "Executor {name} is not supported, use one of: {}",
                    supported_executors()
                );

                Err(ConfigErrors::UnsupportedExecutor(name.to_string()))
            }
        }
    }
}

impl Scheduler for Schedulers {
    type Handle = Handles;

    fn name(&self) -> &'static str {
        match self {
            Self::Local(scheduler) => scheduler.name(),
            #[cfg(feature = "slurm")]
            Self::Slurm(scheduler) => scheduler.name(),
        }
    }

    fn configure(&mut self, params: ResourceParams) -> Result<(), SchedulerError> {
        match self {
            Self::Local(scheduler) => scheduler.configure(params),
            #[cfg(feature = "slurm")]
            Self::Slurm(scheduler) => scheduler.configure(params),
        }
    }

    fn submit_array(
        &mut self,
        jobs: Vec<JobPayload>,
    ) -> Result<Vec<Option<Self::Handle>>, SchedulerError> {
        match self {
            Self::Local(scheduler) => Ok(scheduler
                .submit_array(jobs)?
                .into_iter()
                .map(|handle| handle.map(Handles::Local))
                .collect()),
            #[cfg(feature = "slurm")]
            Self::Slurm(scheduler) => Ok(scheduler
                .submit_array(jobs)?
                .into_iter()
                .map(|handle| handle.map(Handles::Slurm))
                .collect()),
        }
    }
}

impl JobHandle for Handles {
    fn job_id(&self) -> &str {
        match self {
            Self::Local(handle) => handle.job_id(),
            #[cfg(feature = "slurm")]
            Self::Slurm(handle) => handle.job_id(),
        }
    }

    fn result(self) -> Result<Vec<TaskOutcome>, SchedulerError> {
        match self {
            Self::Local(handle) => handle.result(),
            #[cfg(feature = "slurm")]
            Self::Slurm(handle) => handle.result(),
        }
    }
}
