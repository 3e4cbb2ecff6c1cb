use crate::{
    config::SweepFile,
    dispatcher::{run_chunk_files, Dispatcher},
    executors::pooled::{serve_worker, WorkerCommand},
    launcher::{LaunchError, Launcher},
    logging::{init_logging, LogLevel},
    resolve::OverrideResolver,
    scheduler::Schedulers,
    state,
    task::{TaskFunction, TaskOutcome},
};
use clap::{Parser, Subcommand};
use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked parameter sweeps on cluster schedulers")]
pub struct Cli {
    /// overrides CHUNKSWEEP_LOG
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch every task of a sweep file and print the outcomes
    Launch {
        sweep: PathBuf,
        /// global index of the first task
        #[arg(long, default_value_t = 0)]
        initial_index: usize,
    },
    /// Execute one chunk inside a scheduler job
    RunChunk { payload: PathBuf, results: PathBuf },
    /// Execute a single task read from stdin, used by pooled workers
    Worker,
}

/// Entry point of an application binary, `task_fn` is executed once per task of a sweep
pub fn run<F: TaskFunction + 'static>(task_fn: F) -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let task_fn: Arc<dyn TaskFunction> = Arc::new(task_fn);

    match cli.command {
        Commands::Launch {
            sweep,
            initial_index,
        } => match launch(task_fn, &sweep, initial_index) {
            Ok(outcomes) => report(&outcomes),
            Err(error) => {
                error!(error = ?error, "Launch failed: {error}");

                ExitCode::FAILURE
            }
        },
        Commands::RunChunk { payload, results } => {
            let dispatcher = match dispatcher(task_fn) {
                Ok(dispatcher) => dispatcher,
                Err(error) => {
                    error!(error = ?error, "Failed to locate worker executable");

                    return ExitCode::FAILURE;
                }
            };

            match run_chunk_files(&dispatcher, &payload, &results) {
                Ok(outcomes) => {
                    info!(tasks = outcomes.len(), "Chunk finished");

                    ExitCode::SUCCESS
                }
                Err(error) => {
                    error!(error = ?error, "Chunk failed: {error}");

                    ExitCode::FAILURE
                }
            }
        }
        Commands::Worker => {
            match serve_worker(task_fn.as_ref(), &OverrideResolver, io::stdin(), io::stdout()) {
                // a failed task is still a successful worker, the failure is in the outcome
                Ok(_) => ExitCode::SUCCESS,
                Err(error) => {
                    error!(error = ?error, "Worker failed: {error}");

                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn dispatcher(task_fn: Arc<dyn TaskFunction>) -> io::Result<Dispatcher> {
    Ok(Dispatcher::new(
        task_fn,
        Arc::new(OverrideResolver),
        WorkerCommand::current()?,
    ))
}

/// load a sweep file, seed the registry and run the sweep
pub fn launch(
    task_fn: Arc<dyn TaskFunction>,
    sweep: &std::path::Path,
    initial_index: usize,
) -> Result<Vec<TaskOutcome>, LaunchError> {
    let sweep = SweepFile::load(sweep)?;

    for (name, value) in sweep.state {
        state::register(name, value);
    }

    let scheduler = Schedulers::load(&sweep.launcher, Arc::new(dispatcher(task_fn)?))?;
    let mut launcher = Launcher::new(sweep.launcher, sweep.base, scheduler)?;

    launcher.launch(&sweep.overrides, initial_index)
}

/// print the outcomes to stdout, fail if any task failed
fn report(outcomes: &[TaskOutcome]) -> ExitCode {
    match serde_yaml::to_string(outcomes) {
        Ok(rendered) => {
            let mut stdout = io::stdout().lock();
            if let Err(error) = stdout.write_all(rendered.as_bytes()) {
                error!(error = ?error, "Failed to print outcomes");
            }
        }
        Err(error) => error!(error = ?error, "Failed to serialize outcomes"),
    }

    if outcomes.iter().all(TaskOutcome::is_completed) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
