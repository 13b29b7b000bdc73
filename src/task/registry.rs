//! Task factories by name

use super::builtin::{ColumnExtract, RecordCount};
use super::DatabaseTask;
use crate::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a task instance from its parameters
pub type TaskFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn DatabaseTask>> + Send + Sync>;

/// Explicit name to factory table, built once at startup
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the tasks shipped with the crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(RecordCount::NAME, |params| {
            Ok(Box::new(RecordCount::from_params(params)?) as Box<dyn DatabaseTask>)
        });
        registry.register(ColumnExtract::NAME, |params| {
            Ok(Box::new(ColumnExtract::from_params(params)?) as Box<dyn DatabaseTask>)
        });
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn DatabaseTask>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn create(&self, name: &str, params: &Value) -> Result<Box<dyn DatabaseTask>> {
        let Some(factory) = self.factories.get(name) else {
            anyhow::bail!("Unknown task '{}' (available: {})", name, self.names().join(", "));
        };
        factory(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").field("tasks", &self.names()).finish()
    }
}
