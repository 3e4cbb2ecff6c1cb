//! Chunked parameter sweeps on cluster schedulers.
//!
//! A sweep of N tasks is cut into chunks of `chunk_size` tasks, every chunk becomes one
//! scheduler job and the outcomes come back in the order the tasks were given.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod executors;
pub mod launcher;
pub mod logging;
pub mod partition;
pub mod resolve;
pub mod scheduler;
pub mod state;
pub mod task;

pub use config::{LauncherConfig, StrategyConfig, SweepFile};
pub use dispatcher::{Dispatcher, JobEnvironment, JobPayload};
pub use launcher::{LaunchError, Launcher};
pub use resolve::{ConfigResolver, OverrideResolver, ResolvedConfig};
pub use task::{Outcome, TaskContext, TaskFailure, TaskFunction, TaskOutcome, TaskSpec};

#[cfg(test)]
mod launcher_test;
#[cfg(test)]
mod resolve_test;
#[cfg(test)]
mod state_test;
#[cfg(test)]
mod test_util;
