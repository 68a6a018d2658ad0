use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::{Client, Collection};

use crate::catalog::{Catalog, InstanceStore};
use crate::cli::config::CatalogConfig;
use crate::engine::types::{DataSource, WorkflowConfig, WorkflowInstance};
use crate::error::{Error, Result};

/// MongoDB-backed catalog and instance store.
pub struct MongoStore {
    client: Client,
    workflows: Collection<WorkflowConfig>,
    datasources: Collection<DataSource>,
    instances: Collection<WorkflowInstance>,
}

impl MongoStore {
    /// Connect and ping the configured database.
    pub async fn connect(cfg: &CatalogConfig) -> Result<Self> {
        let client = Client::with_uri_str(&cfg.dsn)
            .await
            .map_err(|e| Error::Connection(format!("catalog: {}", e)))?;

        let db = client.database(&cfg.database);
        db.run_command(doc! {"ping": 1})
            .await
            .map_err(|e| Error::Connection(format!("catalog ping: {}", e)))?;

        Ok(Self {
            workflows: db.collection(&cfg.workflow_collection),
            datasources: db.collection(&cfg.datasource_collection),
            instances: db.collection(&cfg.instance_collection),
            client,
        })
    }

    /// Clean shutdown of the underlying client.
    pub async fn shutdown(&self) {
        self.client.clone().shutdown().await;
    }
}

#[async_trait]
impl Catalog for MongoStore {
    async fn find_enabled_workflow(&self, topic: &str, channel: &str) -> Result<WorkflowConfig> {
        self.workflows
            .find_one(doc! {"topic": topic, "channel": channel, "enabled": true})
            .await?
            .ok_or_else(|| Error::NotFound(format!("no enabled workflow for {}:{}", topic, channel)))
    }

    async fn list_enabled_workflows(&self) -> Result<Vec<WorkflowConfig>> {
        let cursor = self.workflows.find(doc! {"enabled": true}).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list_datasources(&self) -> Result<Vec<DataSource>> {
        let cursor = self.datasources.find(doc! {}).await?;
        Ok(cursor.try_collect().await?)
    }
}

#[async_trait]
impl InstanceStore for MongoStore {
    async fn upsert_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        self.instances
            .replace_one(doc! {"id": &instance.id}, instance)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<WorkflowInstance> {
        self.instances
            .find_one(doc! {"id": id})
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {} not found", id)))
    }
}
