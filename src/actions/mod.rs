pub mod builtin;
pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::datasource::DataSourceManager;
use crate::engine::types::{BusMessage, JsonMap};
use crate::error::Result;

/// Per-attempt view an action receives: the resource managers plus the
/// execution state accumulated so far. Built fresh by the executor for every
/// attempt; actions never mutate it.
pub struct ActionContext<'a> {
    pub datasources: &'a DataSourceManager,
    pub message: &'a BusMessage,
    pub vars: &'a JsonMap,
    /// Output of the last task that completed without error, `Null` before
    /// the first one.
    pub previous_output: &'a Value,
}

impl ActionContext<'_> {
    /// Expand `{{nsq.KEY}}`, `{{KEY}}`, and `{{output.KEY}}` placeholders
    /// against this context.
    pub fn expand(&self, template: &str) -> String {
        template::expand(template, &self.message.data, self.vars, self.previous_output)
    }
}

/// One task's slice of the workflow: its `params` mapping.
pub struct TaskContext<'a> {
    params: &'a JsonMap,
}

impl<'a> TaskContext<'a> {
    pub fn new(params: &'a JsonMap) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &JsonMap {
        self.params
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// Trait all actions implement. An action performs I/O against its params
/// and returns the task output recorded under the task's id.
#[async_trait]
pub trait Action: Send + Sync {
    /// Name tasks use to resolve this action (e.g. "http_client").
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    async fn run(&self, ctx: &ActionContext<'_>, task: &TaskContext<'_>) -> Result<Value>;
}

/// Registry of available actions. Populated at executor construction and
/// read-only afterwards.
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Create a registry with all built-in actions registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register an action implementation.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    /// Look up an action by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// List all registered actions with descriptions.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .actions
            .values()
            .map(|a| (a.name(), a.description()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}
