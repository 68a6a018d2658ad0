use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Configuration loaded from `nsa.yaml`. Every section is optional and
/// falls back to its defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub catalog: CatalogConfig,
    pub logging: LoggingConfig,
    pub admin: AdminConfig,
    pub bus: BusConfig,
}

/// Carried for the administrative surface; unused by the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub mode: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            mode: "release".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub dsn: String,
    pub database: String,
    pub workflow_collection: String,
    pub datasource_collection: String,
    pub instance_collection: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dsn: "mongodb://127.0.0.1:27017".to_string(),
            database: "nsa".to_string(),
            workflow_collection: "workflows".to_string(),
            datasource_collection: "datasources".to_string(),
            instance_collection: "workflow_instances".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Carried for the administrative surface; unused by the core.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub lookupd_addresses: Vec<String>,
    pub nsqd_addresses: Vec<String>,
    /// How often the consumer set is reconciled against the catalog.
    pub reload_interval_seconds: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lookupd_addresses: vec!["127.0.0.1:4161".to_string()],
            nsqd_addresses: Vec::new(),
            reload_interval_seconds: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `nsa.yaml` in cwd; return defaults
    ///   if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("nsa.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }
}
