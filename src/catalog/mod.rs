pub mod memory;
pub mod mongo;

use async_trait::async_trait;

use crate::engine::types::{DataSource, WorkflowConfig, WorkflowInstance};
use crate::error::Result;

/// Read-only view of the workflow/data-source catalog. The administrative
/// surface writes; the core only reads.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// The enabled workflow bound to `(topic, channel)`.
    async fn find_enabled_workflow(&self, topic: &str, channel: &str) -> Result<WorkflowConfig>;

    async fn list_enabled_workflows(&self) -> Result<Vec<WorkflowConfig>>;

    /// Every configured data source, for hydrating the data-source manager
    /// at startup.
    async fn list_datasources(&self) -> Result<Vec<DataSource>>;
}

/// Persistence for workflow instances, keyed by the application-level id.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert or replace by `instance.id`; running it twice with the same
    /// instance yields one document.
    async fn upsert_instance(&self, instance: &WorkflowInstance) -> Result<()>;

    async fn get_instance(&self, id: &str) -> Result<WorkflowInstance>;
}
