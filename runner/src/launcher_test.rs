use crate::{
    config::{ConfigErrors, LauncherConfig, ResourceParams},
    dispatcher::{ChunkRunner, Dispatcher, JobEnvironment, JobPayload},
    executors::pooled::WorkerCommand,
    launcher::{LaunchError, Launcher},
    resolve::OverrideResolver,
    scheduler::{local::LocalScheduler, JobHandle, Scheduler, SchedulerError},
    task::{TaskFailure, TaskOutcome},
    test_util::echo_x,
};
use serde_yaml::Value;
use std::{os::unix::fs::PermissionsExt, sync::Arc};

fn dispatcher() -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        Arc::new(echo_x),
        Arc::new(OverrideResolver),
        WorkerCommand::new("/bin/false", Vec::new()),
    ))
}

fn sweep(values: impl IntoIterator<Item = i64>) -> Vec<Vec<String>> {
    values
        .into_iter()
        .map(|value| vec![format!("x={value}"), format!("launcher.note=run{value}")])
        .collect()
}

/// runs every job right away on the calling thread, drops the jobs listed in `lost`
struct InlineScheduler {
    runner: Arc<Dispatcher>,
    lost: Vec<usize>,
    params: ResourceParams,
    payloads: Vec<JobPayload>,
}

struct InlineHandle {
    job_id: String,
    outcomes: Vec<TaskOutcome>,
}

impl InlineScheduler {
    fn new(lost: Vec<usize>) -> Self {
        Self {
            runner: dispatcher(),
            lost,
            params: ResourceParams::new(),
            payloads: Vec::new(),
        }
    }
}

impl Scheduler for InlineScheduler {
    type Handle = InlineHandle;

    fn name(&self) -> &'static str {
        "inline"
    }

    fn configure(&mut self, params: ResourceParams) -> Result<(), SchedulerError> {
        self.params = params;
        Ok(())
    }

    fn submit_array(
        &mut self,
        jobs: Vec<JobPayload>,
    ) -> Result<Vec<Option<Self::Handle>>, SchedulerError> {
        let mut handles = Vec::new();

        for payload in jobs {
            let job_id = format!("inline_{}", payload.chunk);
            let environment = JobEnvironment::new(job_id.clone());
            let outcomes = self.runner.run_chunk(&payload, &environment)?;

            if self.lost.contains(&payload.chunk) {
                handles.push(None);
            } else {
                handles.push(Some(InlineHandle { job_id, outcomes }));
            }
            self.payloads.push(payload);
        }

        Ok(handles)
    }
}

impl JobHandle for InlineHandle {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn result(self) -> Result<Vec<TaskOutcome>, SchedulerError> {
        Ok(self.outcomes)
    }
}

#[test]
pub fn chunks_and_ordered_results() {
    let dir = tempfile::tempdir().unwrap();
    let config = LauncherConfig::new("local", 3, dir.path().join("sweep"));
    let mut launcher = Launcher::new(config, Value::Null, InlineScheduler::new(Vec::new())).unwrap();

    let outcomes = launcher.launch(&sweep(0..7), 10).unwrap();

    let scheduler = launcher.scheduler();
    assert_eq!(
        scheduler
            .payloads
            .iter()
            .map(|payload| payload.tasks.len())
            .collect::<Vec<_>>(),
        vec![3, 3, 1]
    );
    assert!(scheduler.payloads.iter().all(|payload| payload.slots == 3));
    assert_eq!(scheduler.payloads[1].tasks[0].index, 13);
    assert_eq!(scheduler.params.get("tasks_per_node"), Some(&Value::from(1)));

    assert_eq!(outcomes.len(), 7);
    for (offset, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.index, 10 + offset);
        assert_eq!(outcome.value(), Some(&Value::from(offset as i64)));
    }

    // every task got its own directory below the sweep dir
    assert!(dir.path().join("sweep").join("16").join("config.yaml").exists());
}

#[test]
pub fn failures_stay_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let config = LauncherConfig::new("local", 2, dir.path());
    let mut launcher = Launcher::new(config, Value::Null, InlineScheduler::new(Vec::new())).unwrap();

    let mut overrides = sweep(0..5);
    overrides[2].push(String::from("fail=true"));

    let outcomes = launcher.launch(&overrides, 0).unwrap();

    assert_eq!(outcomes.len(), 5);
    assert_eq!(
        outcomes[2].failure(),
        Some(&TaskFailure::Error(String::from("asked to fail")))
    );
    assert!(outcomes
        .iter()
        .enumerate()
        .filter(|(position, _)| *position != 2)
        .all(|(_, outcome)| outcome.is_completed()));
}

#[test]
pub fn lost_jobs_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = LauncherConfig::new("local", 2, dir.path());
    let mut launcher = Launcher::new(config, Value::Null, InlineScheduler::new(vec![1])).unwrap();

    let outcomes = launcher.launch(&sweep(0..5), 0).unwrap();

    assert_eq!(
        outcomes.iter().map(|outcome| outcome.index).collect::<Vec<_>>(),
        vec![0, 1, 4]
    );
}

#[test]
pub fn empty_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let config = LauncherConfig::new("local", 2, dir.path().join("never"));
    let mut launcher = Launcher::new(config, Value::Null, InlineScheduler::new(Vec::new())).unwrap();

    assert!(launcher.launch(&[], 0).unwrap().is_empty());
    assert!(launcher.scheduler().payloads.is_empty());
    assert!(!dir.path().join("never").exists());
}

#[test]
pub fn invalid_config_submits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LauncherConfig::new("local", 2, dir.path());
    config.task_slots_per_node = 4;
    let mut launcher = Launcher::new(config, Value::Null, InlineScheduler::new(Vec::new())).unwrap();

    assert!(matches!(
        launcher.launch(&sweep(0..3), 0),
        Err(LaunchError::Config(ConfigErrors::TaskSlotsPerNode(4)))
    ));
    assert!(launcher.scheduler().payloads.is_empty());
}

#[test]
pub fn sweep_dir_permissions() {
    let dir = tempfile::tempdir().unwrap();
    let sweep_dir = dir.path().join("shared");
    let mut config = LauncherConfig::new("local", 2, &sweep_dir);
    config.sweep_directory_permission_mode = Some(String::from("750"));
    let mut launcher = Launcher::new(config, Value::Null, InlineScheduler::new(Vec::new())).unwrap();

    launcher.launch(&sweep(0..1), 0).unwrap();

    let mode = std::fs::metadata(&sweep_dir).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o750);
}

#[test]
pub fn hidden_overrides() {
    let config = LauncherConfig::new("local", 2, "/tmp/sweep");
    let launcher = Launcher::new(config, Value::Null, InlineScheduler::new(Vec::new())).unwrap();

    let overrides = vec![
        String::from("x=1"),
        String::from("launcher.note=hidden"),
        String::from("+y=2"),
    ];
    assert_eq!(launcher.filter_overrides(&overrides), vec!["x=1", "+y=2"]);
}

#[test]
pub fn local_scheduler_threads() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LauncherConfig::new("local", 2, dir.path());
    config
        .resource_params
        .insert(String::from("mem_gb"), Value::from(4));
    let scheduler = LocalScheduler::new(dispatcher() as Arc<dyn ChunkRunner>);
    let mut launcher = Launcher::new(config, Value::Null, scheduler).unwrap();

    let outcomes = launcher.launch(&sweep(0..5), 0).unwrap();

    assert_eq!(
        outcomes
            .iter()
            .map(|outcome| outcome.value().cloned())
            .collect::<Vec<_>>(),
        (0..5).map(|value| Some(Value::from(value))).collect::<Vec<_>>()
    );
    assert_eq!(
        launcher.scheduler().params().get("mem_gb"),
        Some(&Value::from(4))
    );
}
