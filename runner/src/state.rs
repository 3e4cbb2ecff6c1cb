//! Process-wide registry of named values that configuration resolution reads from.
//!
//! The launching process fills the registry, every task gets a deep copy of it at submission
//! time (`capture`) and each worker rebuilds its own copy (`restore`) before resolving the task
//! configuration. In-process workers never touch the live registry of the launcher.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::new()));

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct Registry {
    entries: BTreeMap<String, serde_yaml::Value>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&serde_yaml::Value> {
        self.entries.get(name)
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: serde_yaml::Value,
    ) -> Option<serde_yaml::Value> {
        self.entries.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<serde_yaml::Value> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_yaml::Value)> {
        self.entries.iter()
    }
}

/// Deep snapshot of the registry, only ever produced by `capture`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct CapturedState(Registry);

impl CapturedState {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// insert or replace a value in the process-wide registry
pub fn register(name: impl Into<String>, value: serde_yaml::Value) -> Option<serde_yaml::Value> {
    let name = name.into();
    trace!(name = %name, "Registering global value");

    REGISTRY.write().insert(name, value)
}

pub fn unregister(name: &str) -> Option<serde_yaml::Value> {
    REGISTRY.write().remove(name)
}

/// clone a single value out of the process-wide registry
pub fn lookup(name: &str) -> Option<serde_yaml::Value> {
    REGISTRY.read().get(name).cloned()
}

pub fn capture() -> CapturedState {
    CapturedState(REGISTRY.read().clone())
}

/// Rebuild a private registry from a snapshot.
pub fn restore(state: &CapturedState) -> Registry {
    state.0.clone()
}

/// Overwrite the process-wide registry with a snapshot.
///
/// Only meant for the entry point of a dedicated worker process, where the process is owned by
/// a single task. Restoring the same snapshot twice leaves the registry unchanged.
pub fn restore_global(state: &CapturedState) {
    debug!(entries = state.0.len(), "Restoring global registry");

    *REGISTRY.write() = state.0.clone();
}
