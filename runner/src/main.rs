use chunksweep::{TaskContext, TaskFailure};
use serde_yaml::{Mapping, Value};
use std::{process::ExitCode, thread, time::Duration};
use tracing::info;

/// Demo task: echoes its resolved configuration.
///
/// `sleep_secs` delays the task, `fail: true` makes it fail.
fn echo(context: &TaskContext) -> Result<Value, TaskFailure> {
    let config = &context.config;

    if let Some(seconds) = config.get("sleep_secs").and_then(Value::as_f64) {
        thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
    }

    if config.get("fail").and_then(Value::as_bool).unwrap_or(false) {
        return Err(TaskFailure::Error(String::from("asked to fail")));
    }

    info!(workdir = ?context.workdir, "Echoing task configuration");

    let mut echoed = Mapping::new();
    echoed.insert(
        Value::from("num"),
        config.job.num.map_or(Value::Null, |num| Value::from(num as u64)),
    );
    echoed.insert(
        Value::from("job_id"),
        config.job.id.clone().map_or(Value::Null, Value::from),
    );
    echoed.insert(
        Value::from("workdir"),
        Value::from(context.workdir.to_string_lossy().into_owned()),
    );
    echoed.insert(Value::from("values"), config.values.clone());

    Ok(Value::Mapping(echoed))
}

fn main() -> ExitCode {
    chunksweep::cli::run(echo)
}
