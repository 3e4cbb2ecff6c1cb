use super::TaskRunner;
use crate::task::{TaskOutcome, TaskSpec};
use tracing::{debug, info, warn};

/// Works through a chunk strictly in order on the single slot granted to the job
#[derive(Debug, Clone)]
pub struct SingleWorker {
    slots: usize,
}

impl SingleWorker {
    pub fn new(slots: usize) -> Self {
        Self { slots }
    }

    pub fn execute<R: TaskRunner>(&self, chunk: &[TaskSpec], runner: &R) -> Vec<TaskOutcome> {
        let slots = if chunk.len() > self.slots {
            warn!(
                slots = self.slots,
                tasks = chunk.len(),
                "Chunk holds more tasks than the job has slots, running all of them"
            );

            chunk.len()
        } else {
            self.slots
        };

        let total = chunk.len();
        let mut outcomes = Vec::with_capacity(total);

        for slot in 0..slots {
            // If the number of tasks is not divisible by the chunk size
            // the slots of the last job have nothing to do
            let Some(task) = chunk.get(slot) else {
                debug!(slot, "No task assigned to slot, skipping");
                continue;
            };

            outcomes.push(runner.run(task));
            info!("Done with {}/{total}", outcomes.len());
        }

        outcomes
    }
}
