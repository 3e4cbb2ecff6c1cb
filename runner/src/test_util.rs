use crate::{
    resolve::ResolvedConfig,
    state::CapturedState,
    task::{TaskContext, TaskFailure, TaskSpec},
};
use serde_yaml::Value;
use std::path::Path;

/// base configuration pointing the sweep directory at `dir`
pub fn base_with_dir(dir: &Path) -> Value {
    serde_yaml::from_str(&format!("sweep:\n  dir: {}\n", dir.to_string_lossy()))
        .expect("valid base configuration")
}

pub fn task(index: usize, overrides: &[&str]) -> TaskSpec {
    task_with_state(index, overrides, CapturedState::default())
}

pub fn task_with_state(index: usize, overrides: &[&str], state: CapturedState) -> TaskSpec {
    TaskSpec {
        overrides: overrides.iter().map(|raw| raw.to_string()).collect(),
        dir_key: String::from("sweep.dir"),
        index,
        job_id: format!("job_id_for_{index}"),
        state,
    }
}

/// returns the `x` value of the resolved configuration, fails on `fail: true`, panics on
/// `panic: true`
pub fn echo_x(context: &TaskContext) -> Result<Value, TaskFailure> {
    let config: &ResolvedConfig = &context.config;

    if config.get("panic").and_then(Value::as_bool).unwrap_or(false) {
        panic!("asked to panic");
    }

    if config.get("fail").and_then(Value::as_bool).unwrap_or(false) {
        return Err(TaskFailure::Error(String::from("asked to fail")));
    }

    Ok(config.get("x").cloned().unwrap_or(Value::Null))
}
