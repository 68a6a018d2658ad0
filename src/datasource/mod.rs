use std::collections::HashMap;
use std::time::Duration;

use mongodb::bson::doc;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Connection};
use tokio::sync::RwLock;
use tracing::info;

use crate::engine::types::{DataSource, DataSourceKind};
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    sql: HashMap<String, AnyPool>,
    mongo: HashMap<String, mongodb::Client>,
}

/// Process-wide registry of named connection pools. Lookups copy the pool
/// handle (pools are internally reference-counted), so a concurrent `remove`
/// never invalidates a handle a caller already holds.
pub struct DataSourceManager {
    inner: RwLock<Inner>,
}

impl Default for DataSourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSourceManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Open a pool for `ds`, probe it, and register it under `ds.name`.
    /// An existing entry under the same name is replaced atomically; the
    /// displaced pool is closed after the swap.
    pub async fn add(&self, ds: &DataSource) -> Result<()> {
        let url = connection_url(ds);

        match ds.kind {
            DataSourceKind::Mongodb => {
                let client = mongodb::Client::with_uri_str(&url)
                    .await
                    .map_err(|e| Error::Connection(format!("datasource {}: {}", ds.name, e)))?;

                let probe_db = if ds.database.is_empty() {
                    "admin"
                } else {
                    ds.database.as_str()
                };
                if let Err(e) = client.database(probe_db).run_command(doc! {"ping": 1}).await {
                    client.shutdown().await;
                    return Err(Error::Connection(format!(
                        "datasource {} failed liveness probe: {}",
                        ds.name, e
                    )));
                }

                let old = {
                    let mut inner = self.inner.write().await;
                    inner.mongo.insert(ds.name.clone(), client)
                };
                if let Some(old) = old {
                    old.shutdown().await;
                }
            }
            _ => {
                // Install any drivers that are compiled in
                sqlx::any::install_default_drivers();

                let mut options = AnyPoolOptions::new()
                    .max_connections(ds.max_open.max(1))
                    .min_connections(ds.max_idle);
                if ds.max_lifetime_seconds > 0 {
                    options = options.max_lifetime(Duration::from_secs(ds.max_lifetime_seconds));
                }

                let pool = options
                    .connect(&url)
                    .await
                    .map_err(|e| Error::Connection(format!("datasource {}: {}", ds.name, e)))?;

                let probe = async {
                    let mut conn = pool.acquire().await?;
                    conn.ping().await
                };
                if let Err(e) = probe.await {
                    pool.close().await;
                    return Err(Error::Connection(format!(
                        "datasource {} failed liveness probe: {}",
                        ds.name, e
                    )));
                }

                let old = {
                    let mut inner = self.inner.write().await;
                    inner.sql.insert(ds.name.clone(), pool)
                };
                if let Some(old) = old {
                    old.close().await;
                }
            }
        }

        info!(name = %ds.name, kind = %ds.kind, "Data source added");
        Ok(())
    }

    /// Get the SQL pool registered under `name`.
    pub async fn get_sql(&self, name: &str) -> Result<AnyPool> {
        let inner = self.inner.read().await;
        inner
            .sql
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("datasource {} not found", name)))
    }

    /// Get the MongoDB client registered under `name`.
    pub async fn get_mongo(&self, name: &str) -> Result<mongodb::Client> {
        let inner = self.inner.read().await;
        inner
            .mongo
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("datasource {} not found", name)))
    }

    /// Close and remove the entry under `name`. A remove with no matching
    /// name is a no-op.
    pub async fn remove(&self, name: &str) {
        let (sql, mongo) = {
            let mut inner = self.inner.write().await;
            (inner.sql.remove(name), inner.mongo.remove(name))
        };
        if let Some(pool) = sql {
            pool.close().await;
            info!(name, "Data source removed");
        }
        if let Some(client) = mongo {
            client.shutdown().await;
            info!(name, "Data source removed");
        }
    }

    /// Drain and remove every pool.
    pub async fn close(&self) {
        let inner = {
            let mut guard = self.inner.write().await;
            std::mem::take(&mut *guard)
        };
        for (_, pool) in inner.sql {
            pool.close().await;
        }
        for (_, client) in inner.mongo {
            client.shutdown().await;
        }
    }
}

/// Build the connection URL for a data source, per dialect.
pub fn connection_url(ds: &DataSource) -> String {
    let credentials = if ds.username.is_empty() {
        String::new()
    } else {
        format!("{}:{}@", ds.username, ds.password)
    };

    match ds.kind {
        DataSourceKind::Mysql => format!(
            "mysql://{}{}:{}/{}",
            credentials, ds.host, ds.port, ds.database
        ),
        DataSourceKind::Postgresql => {
            let sslmode = if ds.ssl { "require" } else { "disable" };
            format!(
                "postgres://{}{}:{}/{}?sslmode={}",
                credentials, ds.host, ds.port, ds.database, sslmode
            )
        }
        DataSourceKind::Sqlserver => format!(
            "sqlserver://{}{}:{}?database={}",
            credentials, ds.host, ds.port, ds.database
        ),
        DataSourceKind::Oracle => format!(
            "oracle://{}{}:{}/{}",
            credentials, ds.host, ds.port, ds.database
        ),
        DataSourceKind::Mongodb => format!(
            "mongodb://{}{}:{}/{}",
            credentials, ds.host, ds.port, ds.database
        ),
        // The database field carries the file path.
        DataSourceKind::Sqlite => format!("sqlite://{}?mode=rwc", ds.database),
    }
}
