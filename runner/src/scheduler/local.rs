use super::{JobHandle, Scheduler, SchedulerError};
use crate::{
    config::ResourceParams,
    dispatcher::{ChunkRunner, JobEnvironment, JobPayload},
    task::{panic_message, TaskOutcome},
};
use std::{
    process,
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{debug, info};

/// Scheduler that runs every job on its own thread of the launching process
pub struct LocalScheduler {
    runner: Arc<dyn ChunkRunner>,
    params: ResourceParams,
    submitted: usize,
}

pub struct LocalHandle {
    job_id: String,
    thread: JoinHandle<Result<Vec<TaskOutcome>, SchedulerError>>,
}

impl LocalScheduler {
    pub fn new(runner: Arc<dyn ChunkRunner>) -> Self {
        Self {
            runner,
            params: ResourceParams::new(),
            submitted: 0,
        }
    }

    pub fn params(&self) -> &ResourceParams {
        &self.params
    }
}

impl Scheduler for LocalScheduler {
    fn name(&self) -> &'static str {
        "local"
    }

    type Handle = LocalHandle;

    fn configure(&mut self, params: ResourceParams) -> Result<(), SchedulerError> {
        // threads can't be limited in time or memory, the parameters are kept for inspection
        for (key, value) in params.iter() {
            debug!(key = key.as_str(), value = ?value, "Local resource parameter");
        }
        self.params = params;

        Ok(())
    }

    fn submit_array(
        &mut self,
        jobs: Vec<JobPayload>,
    ) -> Result<Vec<Option<Self::Handle>>, SchedulerError> {
        let mut handles = Vec::with_capacity(jobs.len());

        for payload in jobs {
            let job_id = format!("{}_{}", process::id(), self.submitted);
            self.submitted += 1;

            let runner = Arc::clone(&self.runner);
            let environment = JobEnvironment::new(job_id.clone());
            let thread = thread::Builder::new()
                .name(format!("job-{job_id}"))
                .spawn(move || runner.run_chunk(&payload, &environment))?;

            info!(job = job_id.as_str(), "Submitted local job");
            handles.push(Some(LocalHandle { job_id, thread }));
        }

        Ok(handles)
    }
}

impl JobHandle for LocalHandle {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn result(self) -> Result<Vec<TaskOutcome>, SchedulerError> {
        match self.thread.join() {
            Ok(outcomes) => outcomes,
            Err(payload) => Err(SchedulerError::JobPanicked {
                job: self.job_id,
                reason: panic_message(payload),
            }),
        }
    }
}
