use crate::{
    config::{ConfigErrors, LauncherConfig},
    dispatcher::JobPayload,
    partition::{chunk_count, partition},
    resolve::{override_key, set_path, ResolveError},
    scheduler::{JobHandle, Scheduler, SchedulerError},
    state,
    task::{TaskOutcome, TaskSpec},
};
use globset::GlobSet;
use itertools::Itertools;
use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Invalid launcher configuration")]
    Config(#[from] ConfigErrors),
    #[error("Scheduler failed")]
    Scheduler(#[from] SchedulerError),
    #[error("Invalid base configuration")]
    Resolve(#[from] ResolveError),
    #[error("Failed to prepare sweep directory {path:?}")]
    SweepDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("I/O failed")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize")]
    Serde(#[from] serde_yaml::Error),
}

/// Launches a sweep: one scheduler job per chunk of tasks, results in task order
pub struct Launcher<S: Scheduler> {
    config: LauncherConfig,
    base: serde_yaml::Value,
    scheduler: S,
    hidden: GlobSet,
}

impl<S: Scheduler> Launcher<S> {
    pub fn new(
        config: LauncherConfig,
        mut base: serde_yaml::Value,
        scheduler: S,
    ) -> Result<Self, LaunchError> {
        let hidden = config.hidden_overrides()?;

        // every task finds the sweep directory under `dir_key`
        set_path(
            &mut base,
            &config.dir_key,
            serde_yaml::Value::String(config.sweep_dir.to_string_lossy().into_owned()),
            &config.dir_key,
        )?;

        Ok(Self {
            config,
            base,
            scheduler,
            hidden,
        })
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Launch one task per entry of `task_overrides`, numbered from `initial_index`.
    ///
    /// Configuration problems fail before anything is submitted. Failing tasks don't fail the
    /// launch, their outcomes are part of the returned sequence.
    #[instrument(skip_all, level = "info", fields(tasks = task_overrides.len(), initial_index = initial_index))]
    pub fn launch(
        &mut self,
        task_overrides: &[Vec<String>],
        initial_index: usize,
    ) -> Result<Vec<TaskOutcome>, LaunchError> {
        self.config.preflight_checks()?;
        let chunk_size = self.config.chunk_size;

        if task_overrides.is_empty() {
            warn!("No tasks to launch");

            return Ok(Vec::new());
        }

        self.scheduler.configure(self.config.resource_params())?;

        info!(
            "Chunked '{}' sweep output dir : {}",
            self.scheduler.name(),
            self.config.sweep_dir.to_string_lossy()
        );
        self.prepare_sweep_dir()?;

        let tasks = task_overrides
            .iter()
            .enumerate()
            .map(|(offset, overrides)| {
                let index = initial_index + offset;
                info!("\t#{index} : {}", self.filter_overrides(overrides).join(" "));

                TaskSpec {
                    overrides: overrides.clone(),
                    dir_key: self.config.dir_key.clone(),
                    index,
                    job_id: format!("job_id_for_{index}"),
                    state: state::capture(),
                }
            })
            .collect_vec();

        let jobs = partition(tasks, chunk_size)?
            .into_iter()
            .enumerate()
            .map(|(chunk, tasks)| JobPayload {
                chunk,
                slots: chunk_size,
                strategy: self.config.strategy.clone(),
                base: self.base.clone(),
                tasks,
            })
            .collect_vec();
        let expected = chunk_count(task_overrides.len(), chunk_size);

        debug!(jobs = jobs.len(), chunk_size, "Submitting chunks");
        let handles = self.scheduler.submit_array(jobs)?;
        if handles.len() != expected {
            warn!(
                handles = handles.len(),
                expected, "Scheduler returned an unexpected number of handles"
            );
        }

        // collect in submission order, which is the global task order
        let mut outcomes = Vec::with_capacity(task_overrides.len());
        for (chunk, handle) in handles.into_iter().enumerate() {
            match handle {
                Some(handle) => {
                    debug!(chunk, job = handle.job_id(), "Waiting for job");
                    outcomes.extend(handle.result()?);
                }
                None => warn!(chunk, "Scheduler reported no job for chunk, skipping it"),
            }
        }

        let failed = outcomes
            .iter()
            .filter(|outcome| !outcome.is_completed())
            .count();
        info!(
            completed = outcomes.len() - failed,
            failed, "Sweep finished"
        );

        Ok(outcomes)
    }

    /// overrides shown in the task log lines
    pub fn filter_overrides<'o>(&self, overrides: &'o [String]) -> Vec<&'o str> {
        overrides
            .iter()
            .map(String::as_str)
            .filter(|raw| !self.hidden.is_match(override_key(raw)))
            .collect()
    }

    fn prepare_sweep_dir(&self) -> Result<(), LaunchError> {
        let path = &self.config.sweep_dir;
        let to_error = |source| LaunchError::SweepDir {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(path).map_err(to_error)?;

        if let Some(mode) = self.config.permission_mode()? {
            debug!("Applying permissions {mode:o} to sweep directory");
            fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(to_error)?;
        }

        Ok(())
    }
}
