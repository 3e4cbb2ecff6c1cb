use crate::executors::PoolBackend;
use globset::{Glob, GlobSet, GlobSetBuilder};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::File, io::Error, path::Path, path::PathBuf, str::FromStr};
use thiserror::Error;
use tracing::{error, warn};

/// resource keys every scheduler backend understands, all others get the backend prefix
pub const COMMON_RESOURCE_KEYS: [&str; 8] = [
    "timeout_min",
    "cpus_per_task",
    "gpus_per_node",
    "tasks_per_node",
    "mem_gb",
    "nodes",
    "name",
    "stderr_to_stdout",
];

#[cfg(feature = "slurm")]
pub const SUPPORTED_EXECUTORS: [&str; 2] = ["local", "slurm"];
#[cfg(not(feature = "slurm"))]
pub const SUPPORTED_EXECUTORS: [&str; 1] = ["local"];

pub type ResourceParams = BTreeMap<String, serde_yaml::Value>;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Invalid chunk size {0}, it must be a positive integer")]
    InvalidChunkSize(usize),
    #[error(
        "The chunked launcher runs a single task slot per node, but task_slots_per_node is {0}. \
         Use 1 instead and don't rely on multiple task slots"
    )]
    TaskSlotsPerNode(usize),
    #[error("Pool backend '{0}' is not supported, use 'process'")]
    UnsupportedPoolBackend(String),
    #[error("Pool size must be at least 1")]
    InvalidPoolSize,
    #[error("Task timeout must be at least 1 second, leave it unset to disable it")]
    InvalidTaskTimeout,
    #[error("Executor not supported")]
    UnsupportedExecutor(String),
    #[error("resource_params.{0} is derived by the launcher and can't be set directly")]
    ReservedResourceKey(String),
    #[error("Invalid octal permission mode '{0}'")]
    InvalidPermissionMode(String),
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Failed to read config file")]
    ReadFailed(#[from] Error),
    #[error("Failed to parse config file")]
    ParseFailed(#[from] serde_yaml::Error),
}

/// A complete sweep description as stored on disk
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SweepFile {
    pub launcher: LauncherConfig,
    // base configuration every task starts from
    #[serde(default)]
    pub base: serde_yaml::Value,
    // initial entries of the global registry
    #[serde(default)]
    pub state: BTreeMap<String, serde_yaml::Value>,
    // one list of overrides per task
    #[serde(default)]
    pub overrides: Vec<Vec<String>>,
}

impl SweepFile {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    // Name of the scheduler backend, see Schedulers::load
    #[serde(default = "default_executor")]
    pub executor: String,
    // maximum number of tasks per submitted job
    pub chunk_size: usize,
    #[serde(default = "default_task_slots")]
    pub task_slots_per_node: usize,
    // scheduler bookkeeping: payloads, scripts, logs
    #[serde(default = "default_output_folder")]
    pub output_folder: PathBuf,
    // results of the sweep, one subdirectory per task
    pub sweep_dir: PathBuf,
    #[serde(default)]
    pub sweep_directory_permission_mode: Option<String>,
    // key of the task configuration holding the sweep dir
    #[serde(default = "default_dir_key")]
    pub dir_key: String,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub resource_params: BTreeMap<String, serde_yaml::Value>,
    // only consumed when the scheduler is built
    #[serde(default)]
    pub max_num_timeout: u32,
    // seconds between two result checks of a slurm job
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    // overrides matching these globs are left out of the task log lines
    #[serde(default = "default_hidden_overrides")]
    pub hidden_overrides: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// tasks of a chunk run one after another
    #[default]
    Single,
    /// tasks of a chunk run on a pool of worker processes
    Pooled {
        #[serde(default = "default_pool_backend")]
        pool_backend: String,
        pool_size: usize,
        #[serde(default)]
        task_timeout_secs: Option<u64>,
    },
}

impl LauncherConfig {
    /// Convenience constructor with every optional field at its default
    pub fn new(executor: &str, chunk_size: usize, sweep_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor: executor.to_string(),
            chunk_size,
            task_slots_per_node: default_task_slots(),
            output_folder: default_output_folder(),
            sweep_dir: sweep_dir.into(),
            sweep_directory_permission_mode: None,
            dir_key: default_dir_key(),
            strategy: StrategyConfig::default(),
            resource_params: BTreeMap::new(),
            max_num_timeout: 0,
            poll_interval_secs: default_poll_interval(),
            hidden_overrides: default_hidden_overrides(),
        }
    }

    /// Validate the launch parameters, every problem is logged before the first one is returned
    pub fn preflight_checks(&self) -> Result<(), ConfigErrors> {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut errors = Vec::new();

        if !SUPPORTED_EXECUTORS.contains(&self.executor.as_str()) {
            errors.push(ConfigErrors::UnsupportedExecutor(self.executor.clone()));
        }

        if self.chunk_size == 0 {
            errors.push(ConfigErrors::InvalidChunkSize(self.chunk_size));
        }

        match &self.strategy {
            StrategyConfig::Single => {
                if self.task_slots_per_node != 1 {
                    errors.push(ConfigErrors::TaskSlotsPerNode(self.task_slots_per_node));
                }
            }
            StrategyConfig::Pooled {
                pool_backend,
                pool_size,
                task_timeout_secs,
            } => {
                if let Err(error) = PoolBackend::from_str(pool_backend) {
                    errors.push(error);
                }

                if *pool_size == 0 {
                    errors.push(ConfigErrors::InvalidPoolSize);
                } else if *pool_size < self.chunk_size {
                    warn!(
                        "strategy.pool_size ({pool_size}) is lower than chunk_size ({}), \
                         tasks of a chunk will partially run one after another",
                        self.chunk_size
                    );
                }

                if *task_timeout_secs == Some(0) {
                    errors.push(ConfigErrors::InvalidTaskTimeout);
                }
            }
        }

        if self.resource_params.contains_key("tasks_per_node") {
            errors.push(ConfigErrors::ReservedResourceKey(String::from(
                "tasks_per_node",
            )));
        }

        if let Err(mode_error) = self.permission_mode() {
            errors.push(mode_error);
        }

        if let Err(glob_error) = self.hidden_overrides() {
            errors.push(glob_error);
        }

        for error in errors.iter() {
            error!("Invalid launcher configuration: {error}");
        }

        match errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// parse the optional octal permission mode of the sweep directory
    pub fn permission_mode(&self) -> Result<Option<u32>, ConfigErrors> {
        self.sweep_directory_permission_mode
            .as_deref()
            .map(|mode| {
                u32::from_str_radix(mode, 8)
                    .ok()
                    .filter(|bits| *bits <= 0o7777)
                    .ok_or_else(|| ConfigErrors::InvalidPermissionMode(mode.to_string()))
            })
            .transpose()
    }

    /// Compile the globs of `hidden_overrides`
    pub fn hidden_overrides(&self) -> Result<GlobSet, ConfigErrors> {
        let mut builder = GlobSetBuilder::new();

        for pattern in self.hidden_overrides.iter() {
            builder.add(Glob::new(pattern)?);
        }

        Ok(builder.build()?)
    }

    /// Resource parameters handed to the scheduler for every job of the sweep
    pub fn resource_params(&self) -> ResourceParams {
        let mut params = translate_resource_params(&self.executor, &self.resource_params);

        params.insert(
            String::from("tasks_per_node"),
            serde_yaml::Value::from(self.task_slots_per_node as u64),
        );

        if let StrategyConfig::Pooled { pool_size, .. } = &self.strategy {
            params
                .entry(String::from("cpus_per_task"))
                .or_insert_with(|| serde_yaml::Value::from(*pool_size as u64));
        }

        params
    }
}

/// Map a flat parameter namespace onto scheduler keys, unknown keys get the executor prefix
pub fn translate_resource_params(
    executor: &str,
    params: &BTreeMap<String, serde_yaml::Value>,
) -> ResourceParams {
    let prefix = format!("{executor}_");

    params
        .iter()
        .map(|(key, value)| {
            if COMMON_RESOURCE_KEYS.contains(&key.as_str()) || key.starts_with(&prefix) {
                (key.clone(), value.clone())
            } else {
                (format!("{prefix}{key}"), value.clone())
            }
        })
        .collect()
}

/// comma separated list of the supported executors, used in help texts
pub fn supported_executors() -> String {
    SUPPORTED_EXECUTORS.iter().join(", ")
}

fn default_executor() -> String {
    String::from("local")
}

fn default_task_slots() -> usize {
    1
}

fn default_output_folder() -> PathBuf {
    PathBuf::from(".chunksweep")
}

fn default_dir_key() -> String {
    String::from("sweep.dir")
}

fn default_poll_interval() -> u64 {
    15
}

fn default_pool_backend() -> String {
    PoolBackend::Process.to_string()
}

fn default_hidden_overrides() -> Vec<String> {
    vec![String::from("launcher.*")]
}
