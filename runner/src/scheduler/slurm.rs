/*
 * Slurm backend:
 * 1. Write one payload file per chunk into a fresh array directory below the output folder
 * 2. Render an sbatch script for a job array, one array task per chunk
 * 3. Submit with `sbatch --parsable`, every array task runs `<program> run-chunk`
 * 4. Handles poll for the result file of their array task and ask squeue whether it is alive
 */

use super::{JobHandle, Scheduler, SchedulerError};
use crate::{config::ResourceParams, dispatcher::JobPayload, task::TaskOutcome};
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::{self, Command, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, info, trace, warn};
use wait_timeout::ChildExt;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct SlurmScheduler {
    folder: PathBuf,
    program: PathBuf,
    params: ResourceParams,
    max_num_timeout: u32,
    poll_interval: Duration,
    submitted: usize,
}

#[derive(Debug)]
pub struct SlurmHandle {
    job_id: String,
    results: PathBuf,
    poll_interval: Duration,
}

impl SlurmScheduler {
    pub fn new(folder: PathBuf, program: PathBuf, max_num_timeout: u32) -> Self {
        Self {
            folder,
            program,
            params: ResourceParams::new(),
            max_num_timeout,
            poll_interval: Duration::from_secs(15),
            submitted: 0,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Render the sbatch script of an array of `count` jobs stored in `array_dir`
    pub fn render_script(&self, array_dir: &Path, count: usize) -> String {
        let mut lines = vec![String::from("#!/bin/bash")];
        let name = self
            .params
            .get("name")
            .map(render_value)
            .unwrap_or_else(|| String::from("chunksweep"));

        lines.push(format!("#SBATCH --job-name={name}"));
        lines.push(format!("#SBATCH --array=0-{}", count.saturating_sub(1)));
        lines.push(format!(
            "#SBATCH --output={}",
            array_dir.join("%A_%a.out").to_string_lossy()
        ));

        let stderr_to_stdout = self
            .params
            .get("stderr_to_stdout")
            .and_then(serde_yaml::Value::as_bool)
            .unwrap_or(false);
        if !stderr_to_stdout {
            lines.push(format!(
                "#SBATCH --error={}",
                array_dir.join("%A_%a.err").to_string_lossy()
            ));
        }

        for (key, value) in self.params.iter() {
            if let Some(directive) = directive(key, value) {
                lines.push(format!("#SBATCH {directive}"));
            }
        }

        if self.max_num_timeout > 0 {
            lines.push(String::from("#SBATCH --requeue"));
        }

        lines.push(String::new());
        lines.push(format!(
            "exec {} run-chunk {} {}",
            shell_quote(&self.program.to_string_lossy()),
            shell_quote(&array_dir.join("payload_").to_string_lossy()) + "${SLURM_ARRAY_TASK_ID}.yaml",
            shell_quote(&array_dir.join("results_").to_string_lossy()) + "${SLURM_ARRAY_TASK_ID}.yaml",
        ));
        lines.push(String::new());

        lines.join("\n")
    }
}

impl Scheduler for SlurmScheduler {
    type Handle = SlurmHandle;

    fn name(&self) -> &'static str {
        "slurm"
    }

    fn configure(&mut self, params: ResourceParams) -> Result<(), SchedulerError> {
        for key in params.keys() {
            if directive_name(key).is_none() && !matches!(key.as_str(), "name" | "stderr_to_stdout")
            {
                warn!(key = key.as_str(), "Resource parameter is not understood by slurm, ignoring");
            }
        }
        self.params = params;

        Ok(())
    }

    fn submit_array(
        &mut self,
        jobs: Vec<JobPayload>,
    ) -> Result<Vec<Option<Self::Handle>>, SchedulerError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let array_dir = self
            .folder
            .join(format!("array_{}_{}", process::id(), self.submitted));
        self.submitted += 1;
        fs::create_dir_all(&array_dir)?;

        for (index, payload) in jobs.iter().enumerate() {
            fs::write(
                array_dir.join(format!("payload_{index}.yaml")),
                serde_yaml::to_string(payload)?,
            )?;
        }

        let script_path = array_dir.join("submit.sh");
        fs::write(&script_path, self.render_script(&array_dir, jobs.len()))?;

        let mut command = Command::new("sbatch");
        command.arg("--parsable").arg(&script_path);
        let output = run_command(&mut command)?;

        // --parsable prints `<job id>[;<cluster>]`
        let array_id = output
            .trim()
            .split(';')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SchedulerError::Submit(format!("unexpected sbatch output '{output}'")))?
            .to_string();

        info!(
            array = array_id.as_str(),
            jobs = jobs.len(),
            folder = ?array_dir,
            poll_interval = ?self.poll_interval(),
            "Submitted slurm job array"
        );

        Ok((0..jobs.len())
            .map(|index| {
                Some(SlurmHandle {
                    job_id: format!("{array_id}_{index}"),
                    results: array_dir.join(format!("results_{index}.yaml")),
                    poll_interval: self.poll_interval,
                })
            })
            .collect())
    }
}

impl SlurmHandle {
    fn read_results(&self) -> Result<Vec<TaskOutcome>, SchedulerError> {
        Ok(serde_yaml::from_reader(fs::File::open(&self.results)?)?)
    }

    /// ask squeue whether the job is still pending or running
    fn is_alive(&self) -> Result<bool, SchedulerError> {
        let mut command = Command::new("squeue");
        command.args(["-h", "-o", "%T", "-j", self.job_id.as_str()]);

        match run_command(&mut command) {
            Ok(state) => {
                trace!(job = self.job_id.as_str(), state = state.trim(), "Polled job state");

                Ok(!state.trim().is_empty())
            }
            // squeue errors out for jobs that already left the queue
            Err(SchedulerError::Command(message)) if message.contains("Invalid job id") => {
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }
}

impl JobHandle for SlurmHandle {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn result(self) -> Result<Vec<TaskOutcome>, SchedulerError> {
        loop {
            if self.results.exists() {
                return self.read_results();
            }

            if !self.is_alive()? {
                // the result file may have appeared between both checks
                return if self.results.exists() {
                    self.read_results()
                } else {
                    Err(SchedulerError::MissingResult(self.job_id))
                };
            }

            debug!(job = self.job_id.as_str(), "Waiting for results");
            thread::sleep(self.poll_interval);
        }
    }
}

/// sbatch flag of a common resource key or of a `slurm_` prefixed key
fn directive_name(key: &str) -> Option<String> {
    match key {
        "timeout_min" => Some(String::from("time")),
        "cpus_per_task" => Some(String::from("cpus-per-task")),
        "gpus_per_node" => Some(String::from("gpus-per-node")),
        "tasks_per_node" => Some(String::from("ntasks-per-node")),
        "mem_gb" => Some(String::from("mem")),
        "nodes" => Some(String::from("nodes")),
        other => other
            .strip_prefix("slurm_")
            .map(|flag| flag.replace('_', "-")),
    }
}

fn directive(key: &str, value: &serde_yaml::Value) -> Option<String> {
    let name = directive_name(key)?;

    match (key, value) {
        ("mem_gb", value) => Some(format!("--{name}={}G", render_value(value))),
        (_, serde_yaml::Value::Bool(true)) => Some(format!("--{name}")),
        (_, serde_yaml::Value::Bool(false)) | (_, serde_yaml::Value::Null) => None,
        (_, value) => Some(format!("--{name}={}", render_value(value))),
    }
}

fn render_value(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(string) => string.clone(),
        serde_yaml::Value::Number(number) => number.to_string(),
        serde_yaml::Value::Bool(flag) => flag.to_string(),
        other => serde_yaml::to_string(other)
            .map(|rendered| rendered.trim().to_string())
            .unwrap_or_default(),
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// run a scheduler command with a timeout and return its stdout
fn run_command(command: &mut Command) -> Result<String, SchedulerError> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| SchedulerError::Command(format!("{command:?}: {error}")))?;

    let status = match child.wait_timeout(COMMAND_TIMEOUT)? {
        Some(status) => status,
        None => {
            child.kill()?;
            child.wait()?;

            return Err(SchedulerError::Command(format!("{command:?} timed out")));
        }
    };

    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_string(&mut stdout)?;
    }

    if status.success() {
        Ok(stdout)
    } else {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }

        Err(SchedulerError::Command(format!(
            "{command:?} exited with {status}: {}",
            stderr.trim()
        )))
    }
}
