use crate::{
    config::StrategyConfig,
    executors::{
        pooled::{ProcessRunner, WorkerCommand},
        ExecutorError, Executors, InProcessRunner,
    },
    resolve::ConfigResolver,
    scheduler::SchedulerError,
    task::{TaskFunction, TaskOutcome, TaskSpec},
};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, process, sync::Arc};
use tracing::{info, instrument, warn};

/// Everything a cluster job receives: one chunk of tasks plus how to execute it
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobPayload {
    // position of the chunk in the sweep
    pub chunk: usize,
    // task slots granted to the job, i.e. the chunk size of the sweep
    pub slots: usize,
    pub strategy: StrategyConfig,
    pub base: serde_yaml::Value,
    pub tasks: Vec<TaskSpec>,
}

/// Identity of the job a chunk is executed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEnvironment {
    pub job_id: String,
    pub hostname: String,
}

impl JobEnvironment {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            hostname: hostname(),
        }
    }

    /// read the job identity from the environment the scheduler set up
    pub fn detect() -> Self {
        let job_id = match (
            env::var("SLURM_ARRAY_JOB_ID"),
            env::var("SLURM_ARRAY_TASK_ID"),
        ) {
            (Ok(array), Ok(task)) => format!("{array}_{task}"),
            _ => env::var("SLURM_JOB_ID")
                .unwrap_or_else(|_| format!("local-{}-{}", hostname(), process::id())),
        };

        Self::new(job_id)
    }
}

fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(error) => {
            warn!(error = ?error, "Failed to retrieve hostname");

            String::from("unknown")
        }
    }
}

/// Something that can execute a whole chunk inside a job
pub trait ChunkRunner: Send + Sync {
    fn run_chunk(
        &self,
        payload: &JobPayload,
        environment: &JobEnvironment,
    ) -> Result<Vec<TaskOutcome>, SchedulerError>;
}

/// Executes the chunk of a job with the strategy requested in its payload
#[derive(Clone)]
pub struct Dispatcher {
    task_fn: Arc<dyn TaskFunction>,
    resolver: Arc<dyn ConfigResolver>,
    worker: WorkerCommand,
}

impl Dispatcher {
    pub fn new(
        task_fn: Arc<dyn TaskFunction>,
        resolver: Arc<dyn ConfigResolver>,
        worker: WorkerCommand,
    ) -> Self {
        Self {
            task_fn,
            resolver,
            worker,
        }
    }

    /// run every task of the chunk, the outcomes follow the order of `payload.tasks`
    #[instrument(skip_all, level = "info", fields(chunk = payload.chunk, job = %environment.job_id))]
    pub fn dispatch(
        &self,
        payload: &JobPayload,
        environment: &JobEnvironment,
    ) -> Result<Vec<TaskOutcome>, ExecutorError> {
        let executor = Executors::load(&payload.strategy, payload.slots)?;

        info!(
            host = %environment.hostname,
            tasks = payload.tasks.len(),
            "Dispatching chunk"
        );

        let outcomes = match &executor {
            Executors::Single(_) => executor.execute(
                &payload.tasks,
                &InProcessRunner {
                    base: &payload.base,
                    job_id: &environment.job_id,
                    task_fn: self.task_fn.as_ref(),
                    resolver: self.resolver.as_ref(),
                },
            )?,
            Executors::Pooled(pooled) => executor.execute(
                &payload.tasks,
                &ProcessRunner {
                    command: &self.worker,
                    base: &payload.base,
                    job_id: &environment.job_id,
                    timeout: pooled.task_timeout(),
                },
            )?,
        };

        let failed = outcomes.iter().filter(|outcome| !outcome.is_completed()).count();
        if failed > 0 {
            warn!("{failed} of {} tasks failed", outcomes.len());
        }
        info!("Done with processing");

        Ok(outcomes)
    }
}

impl ChunkRunner for Dispatcher {
    fn run_chunk(
        &self,
        payload: &JobPayload,
        environment: &JobEnvironment,
    ) -> Result<Vec<TaskOutcome>, SchedulerError> {
        self.dispatch(payload, environment)
            .map_err(|error| SchedulerError::JobFailed {
                job: environment.job_id.clone(),
                reason: error.to_string(),
            })
    }
}

/// Entry point inside a cluster job: read a payload file, run it and store the outcomes.
///
/// The results are written to a temporary file first and renamed afterwards, so a reader never
/// sees a partially written result file.
pub fn run_chunk_files(
    runner: &dyn ChunkRunner,
    payload_path: &Path,
    results_path: &Path,
) -> Result<Vec<TaskOutcome>, SchedulerError> {
    let payload: JobPayload = serde_yaml::from_reader(fs::File::open(payload_path)?)?;
    let environment = JobEnvironment::detect();

    let outcomes = runner.run_chunk(&payload, &environment)?;

    let mut temporary = results_path.as_os_str().to_owned();
    temporary.push(".tmp");
    fs::write(&temporary, serde_yaml::to_string(&outcomes)?)?;
    fs::rename(&temporary, results_path)?;

    Ok(outcomes)
}
