//! Composition of a task configuration from the sweep base configuration and per task overrides.
//!
//! Overrides follow the usual sweep syntax:
//! - `path.to.key=value` sets a value, intermediate mappings are created on demand
//! - `+path.to.key=value` sets a value that must not exist yet
//! - `~path.to.key` removes a value
//!
//! Values are parsed as YAML scalars. After all overrides are applied every string of the
//! document is scanned for `${state:NAME}` references, which are replaced with the value `NAME`
//! has in the registry the task was submitted with.

use crate::state::Registry;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::trace;

const STATE_PREFIX: &str = "${state:";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Malformed override '{0}', expected key=value, +key=value or ~key")]
    MalformedOverride(String),
    #[error("Override '{0}' traverses a value that is not a mapping")]
    NotAMapping(String),
    #[error("Override '{0}' adds a key that already exists, use key=value instead")]
    AlreadyExists(String),
    #[error("Override '{0}' removes a key that does not exist")]
    Missing(String),
    #[error("Registry has no value named '{0}'")]
    UnknownState(String),
    #[error("Registry value '{0}' is not a scalar and can't be embedded into a string")]
    NonScalarState(String),
    #[error("Unterminated registry reference in '{0}'")]
    Unterminated(String),
}

/// Job metadata written into every resolved configuration right before the task runs.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobMetadata {
    // identifier the scheduler assigned to the job executing the task
    pub id: Option<String>,
    // global index of the task
    pub num: Option<usize>,
    pub overrides: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResolvedConfig {
    pub job: JobMetadata,
    pub values: Value,
}

impl ResolvedConfig {
    pub fn new(values: Value) -> Self {
        Self {
            job: JobMetadata::default(),
            values,
        }
    }

    /// Populate the job variables of the configuration.
    pub fn set_job(&mut self, id: &str, num: usize) {
        self.job.id = Some(id.to_string());
        self.job.num = Some(num);
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.values, path)
    }
}

/// Configuration composition as seen by the dispatcher.
pub trait ConfigResolver: Send + Sync {
    fn resolve(
        &self,
        base: &Value,
        overrides: &[String],
        registry: &Registry,
    ) -> Result<ResolvedConfig, ResolveError>;
}

/// Default resolver applying dotted overrides on top of a YAML document
#[derive(Debug, Clone, Copy, Default)]
pub struct OverrideResolver;

impl ConfigResolver for OverrideResolver {
    fn resolve(
        &self,
        base: &Value,
        overrides: &[String],
        registry: &Registry,
    ) -> Result<ResolvedConfig, ResolveError> {
        let mut values = match base {
            Value::Null => Value::Mapping(Mapping::new()),
            other => other.clone(),
        };

        for raw in overrides {
            apply_override(&mut values, raw)?;
        }

        interpolate(&mut values, registry)?;

        let mut config = ResolvedConfig::new(values);
        config.job.overrides = overrides.to_vec();

        Ok(config)
    }
}

/// key part of an override, without its `+` or `~` marker
pub fn override_key(raw: &str) -> &str {
    let key = raw.split_once('=').map_or(raw, |(key, _)| key);

    key.trim_start_matches(['+', '~'])
}

fn apply_override(values: &mut Value, raw: &str) -> Result<(), ResolveError> {
    trace!(raw = raw, "Applying override");

    if let Some(path) = raw.strip_prefix('~') {
        // `~key=value` only removes when the current value matches, which we don't support
        if path.is_empty() || path.contains('=') {
            return Err(ResolveError::MalformedOverride(raw.to_string()));
        }

        return remove_path(values, path, raw);
    }

    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ResolveError::MalformedOverride(raw.to_string()))?;

    match key.strip_prefix('+') {
        Some(path) => {
            if lookup_path(values, path).is_some() {
                return Err(ResolveError::AlreadyExists(raw.to_string()));
            }

            set_path(values, path, parse_value(value), raw)
        }
        None => set_path(values, key, parse_value(value), raw),
    }
}

fn parse_value(raw: &str) -> Value {
    if raw.contains("${") {
        return Value::String(raw.to_string());
    }

    serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn lookup_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .try_fold(root, |current, segment| current.get(segment))
}

/// set a dotted path, creating intermediate mappings on the way
pub fn set_path(root: &mut Value, path: &str, value: Value, raw: &str) -> Result<(), ResolveError> {
    let segments = path.split('.').collect::<Vec<_>>();

    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(ResolveError::MalformedOverride(raw.to_string()));
    }

    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Err(ResolveError::MalformedOverride(raw.to_string())),
    };

    let mut current = root;
    for segment in parents {
        if current.is_null() {
            *current = Value::Mapping(Mapping::new());
        }

        current = current
            .as_mapping_mut()
            .ok_or_else(|| ResolveError::NotAMapping(raw.to_string()))?
            .entry(Value::String(segment.to_string()))
            .or_insert(Value::Null);
    }

    if current.is_null() {
        *current = Value::Mapping(Mapping::new());
    }

    current
        .as_mapping_mut()
        .ok_or_else(|| ResolveError::NotAMapping(raw.to_string()))?
        .insert(Value::String(last.to_string()), value);

    Ok(())
}

fn remove_path(root: &mut Value, path: &str, raw: &str) -> Result<(), ResolveError> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (lookup_path_mut(root, parent), last),
        None => (Some(root), path),
    };

    parent
        .and_then(Value::as_mapping_mut)
        .and_then(|mapping| mapping.remove(last))
        .map(|_| ())
        .ok_or_else(|| ResolveError::Missing(raw.to_string()))
}

fn lookup_path_mut<'v>(root: &'v mut Value, path: &str) -> Option<&'v mut Value> {
    path.split('.')
        .try_fold(root, |current, segment| current.get_mut(segment))
}

/// replace every `${state:NAME}` reference of the document
fn interpolate(value: &mut Value, registry: &Registry) -> Result<(), ResolveError> {
    match value {
        Value::String(text) if text.contains(STATE_PREFIX) => {
            let resolved = interpolate_str(text, registry)?;
            *value = resolved;
        }
        Value::Sequence(sequence) => {
            for item in sequence.iter_mut() {
                interpolate(item, registry)?;
            }
        }
        Value::Mapping(mapping) => {
            for item in mapping.values_mut() {
                interpolate(item, registry)?;
            }
        }
        _ => {}
    }

    Ok(())
}

fn interpolate_str(text: &str, registry: &Registry) -> Result<Value, ResolveError> {
    // a lone reference keeps the type of the registry value
    if let Some(name) = text
        .strip_prefix(STATE_PREFIX)
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|name| !name.contains('}'))
    {
        return registry
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownState(name.to_string()));
    }

    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(STATE_PREFIX) {
        output.push_str(&rest[..start]);
        let after = &rest[start + STATE_PREFIX.len()..];
        let end = after
            .find('}')
            .ok_or_else(|| ResolveError::Unterminated(text.to_string()))?;
        let name = &after[..end];

        match registry.get(name) {
            Some(Value::String(string)) => output.push_str(string),
            Some(Value::Number(number)) => output.push_str(&number.to_string()),
            Some(Value::Bool(flag)) => output.push_str(&flag.to_string()),
            Some(_) => return Err(ResolveError::NonScalarState(name.to_string())),
            None => return Err(ResolveError::UnknownState(name.to_string())),
        }

        rest = &after[end + 1..];
    }
    output.push_str(rest);

    Ok(Value::String(output))
}
