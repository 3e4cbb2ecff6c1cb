use super::{run_task, ExecutorError, PoolBackend, TaskRunner};
use crate::{
    resolve::ConfigResolver,
    state,
    task::{TaskFailure, TaskFunction, TaskOutcome, TaskSpec},
};
use rayon::{prelude::*, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::{
    env,
    ffi::OsString,
    io::{self, Read, Write},
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

/// line separating anything the task printed from the serialized outcome on worker stdout
pub const OUTCOME_MARKER: &str = "--- chunksweep outcome ---";

/// Runs the tasks of a chunk concurrently on a bounded pool of workers
#[derive(Debug, Clone)]
pub struct PooledWorkers {
    backend: PoolBackend,
    pool_size: usize,
    task_timeout: Option<Duration>,
}

impl PooledWorkers {
    pub fn new(backend: PoolBackend, pool_size: usize, task_timeout_secs: Option<u64>) -> Self {
        Self {
            backend,
            pool_size,
            task_timeout: task_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout
    }

    /// execute jobs concurrently with a thread pool, each pool thread drives one worker at a time
    #[instrument(skip_all, level = "debug", fields(backend = %self.backend, pool_size = self.pool_size))]
    pub fn execute<R: TaskRunner>(
        &self,
        chunk: &[TaskSpec],
        runner: &R,
    ) -> Result<Vec<TaskOutcome>, ExecutorError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.pool_size)
            .thread_name(|index| format!("chunk-worker-{index}"))
            .build()?;

        debug!("Started worker pool with {} threads", self.pool_size);

        let total = chunk.len();
        let processed = AtomicUsize::new(0);

        // completion order is arbitrary, every outcome carries the position of its task
        let mut tagged = pool.install(|| {
            chunk
                .iter()
                .enumerate()
                .par_bridge()
                .map(|(position, task)| {
                    let outcome = runner.run(task);
                    info!(
                        "Done with {}/{total}",
                        processed.fetch_add(1, Ordering::SeqCst) + 1
                    );

                    (position, outcome)
                })
                .collect::<Vec<_>>()
        });

        tagged.sort_unstable_by_key(|(position, _)| *position);

        Ok(tagged.into_iter().map(|(_, outcome)| outcome).collect())
    }
}

/// How to start a worker process, usually the current executable with the `worker` subcommand
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn current() -> io::Result<Self> {
        Ok(Self::new(env::current_exe()?, vec![OsString::from("worker")]))
    }
}

/// Everything a worker process needs to run one task
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkerRequest {
    pub base: serde_yaml::Value,
    pub job_id: String,
    pub task: TaskSpec,
}

/// Runs every task in a fresh worker process, the request goes in over stdin and the outcome
/// comes back over stdout
pub struct ProcessRunner<'a> {
    pub command: &'a WorkerCommand,
    pub base: &'a serde_yaml::Value,
    pub job_id: &'a str,
    pub timeout: Option<Duration>,
}

impl TaskRunner for ProcessRunner<'_> {
    fn run(&self, task: &TaskSpec) -> TaskOutcome {
        let request = WorkerRequest {
            base: self.base.clone(),
            job_id: self.job_id.to_string(),
            task: task.clone(),
        };

        match self.spawn(&request) {
            Ok(outcome) if outcome.index == task.index => outcome,
            Ok(outcome) => TaskOutcome::failed(
                task.index,
                TaskFailure::Worker(format!(
                    "worker answered for task {} instead of {}",
                    outcome.index, task.index
                )),
            ),
            Err(failure) => {
                warn!(index = task.index, "Worker failed: {failure}");

                TaskOutcome::failed(task.index, failure)
            }
        }
    }
}

impl ProcessRunner<'_> {
    fn spawn(&self, request: &WorkerRequest) -> Result<TaskOutcome, TaskFailure> {
        let worker_failure = |error: &dyn std::fmt::Display| TaskFailure::Worker(error.to_string());
        let payload = serde_yaml::to_string(request).map_err(|error| worker_failure(&error))?;

        let mut child = Command::new(&self.command.program)
            .args(self.command.args.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|error| worker_failure(&error))?;

        debug!(index = request.task.index, pid = child.id(), "Spawned worker");

        // drain stdout on a separate thread, a chatty task could otherwise fill the pipe while
        // we wait for the child
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskFailure::Worker(String::from("worker stdout is not piped")))?;
        let reader = thread::spawn(move || {
            let mut buffer = String::new();
            stdout.read_to_string(&mut buffer).map(|_| buffer)
        });

        if let Some(mut stdin) = child.stdin.take() {
            // a worker dying early closes the pipe, it must still be reaped
            if let Err(error) = stdin.write_all(payload.as_bytes()) {
                reap(&mut child);

                return Err(worker_failure(&error));
            }
            // Dropping stdin here will close the underlying file descriptor
        }

        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => status,
                Ok(None) => {
                    // child hasn't exited yet
                    reap(&mut child);

                    return Err(TaskFailure::Timeout(timeout.as_secs()));
                }
                Err(error) => {
                    reap(&mut child);

                    return Err(worker_failure(&error));
                }
            },
            None => child.wait().map_err(|error| worker_failure(&error))?,
        };

        let output = reader
            .join()
            .map_err(|_| TaskFailure::Worker(String::from("stdout reader panicked")))?
            .map_err(|error| worker_failure(&error))?;

        if !status.success() {
            return Err(TaskFailure::Worker(format!("worker exited with {status}")));
        }

        parse_outcome(&output)
    }
}

/// kill a worker that is given up on and wait for it, so no zombie is left behind
fn reap(child: &mut Child) {
    if let Err(error) = child.kill() {
        warn!(pid = child.id(), error = ?error, "Failed to kill worker");
    }

    if let Err(error) = child.wait() {
        warn!(pid = child.id(), error = ?error, "Failed to wait for killed worker");
    }
}

/// extract the outcome following the last marker line of the worker output
pub fn parse_outcome(output: &str) -> Result<TaskOutcome, TaskFailure> {
    let (_, serialized) = output
        .rsplit_once(OUTCOME_MARKER)
        .ok_or_else(|| TaskFailure::Worker(String::from("worker produced no outcome")))?;

    serde_yaml::from_str(serialized).map_err(|error| TaskFailure::Worker(error.to_string()))
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker i/o failed")]
    Io(#[from] io::Error),
    #[error("Failed to (de)serialize worker data")]
    Serde(#[from] serde_yaml::Error),
}

/// Entry point of a worker process: read one request, run it, write the outcome.
///
/// The process belongs to this single task, so the captured state is restored process-wide as
/// well as into the private registry handed to the task.
pub fn serve_worker<I: Read, O: Write>(
    task_fn: &dyn TaskFunction,
    resolver: &dyn ConfigResolver,
    mut input: I,
    mut output: O,
) -> Result<TaskOutcome, WorkerError> {
    let mut buffer = String::new();
    input.read_to_string(&mut buffer)?;
    let request: WorkerRequest = serde_yaml::from_str(&buffer)?;

    debug!(index = request.task.index, job = %request.job_id, "Worker received task");

    state::restore_global(&request.task.state);
    let registry = state::restore(&request.task.state);

    let outcome = run_task(
        &request.base,
        &request.job_id,
        &request.task,
        registry,
        task_fn,
        resolver,
    );

    writeln!(output, "{OUTCOME_MARKER}")?;
    output.write_all(serde_yaml::to_string(&outcome)?.as_bytes())?;
    output.flush()?;

    Ok(outcome)
}
