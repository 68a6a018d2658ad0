use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::catalog::{Catalog, InstanceStore};
use crate::engine::types::{DataSource, WorkflowConfig, WorkflowInstance};
use crate::error::{Error, Result};

/// In-process catalog. Holds whatever the caller sets; used by the test
/// suite and single-process embedding.
pub struct MemoryCatalog {
    workflows: Mutex<Vec<WorkflowConfig>>,
    datasources: Mutex<Vec<DataSource>>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            workflows: Mutex::new(Vec::new()),
            datasources: Mutex::new(Vec::new()),
        }
    }

    pub fn set_workflows(&self, workflows: Vec<WorkflowConfig>) {
        *self.workflows.lock().unwrap() = workflows;
    }

    pub fn set_datasources(&self, datasources: Vec<DataSource>) {
        *self.datasources.lock().unwrap() = datasources;
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn find_enabled_workflow(&self, topic: &str, channel: &str) -> Result<WorkflowConfig> {
        self.workflows
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.enabled && w.topic == topic && w.channel == channel)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no enabled workflow for {}:{}", topic, channel)))
    }

    async fn list_enabled_workflows(&self) -> Result<Vec<WorkflowConfig>> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.enabled)
            .cloned()
            .collect())
    }

    async fn list_datasources(&self) -> Result<Vec<DataSource>> {
        Ok(self.datasources.lock().unwrap().clone())
    }
}

/// In-memory instance store. Holds state only for the lifetime of the
/// store instance.
pub struct MemoryInstanceStore {
    instances: Mutex<HashMap<String, WorkflowInstance>>,
}

impl Default for MemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of every stored instance.
    pub fn list(&self) -> Vec<WorkflowInstance> {
        self.instances.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn upsert_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<WorkflowInstance> {
        self.instances
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("instance {} not found", id)))
    }
}
