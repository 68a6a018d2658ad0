pub mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::actions::ActionRegistry;
use crate::bus::ConsumerParams;
use crate::bus::manager::ConsumerManager;
use crate::bus::memory::InMemoryBus;
use crate::catalog::Catalog;
use crate::catalog::mongo::MongoStore;
use crate::cli::config::AppConfig;
use crate::datasource::DataSourceManager;
use crate::engine::executor::Executor;

#[derive(Parser)]
#[command(name = "nsa", version, about = "Message-driven workflow automation service")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to the configuration file (default: auto-detect nsa.yaml)
    #[arg(short, long, global = true, env = "NSA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the workflow service
    Serve,

    /// Parse the configuration and print the resolved values
    CheckConfig,

    /// List available actions
    Actions,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    load_dotenv(cli.dotenv.as_deref());

    let config = AppConfig::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    match cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::CheckConfig => cmd_check_config(config),
        Commands::Actions => cmd_actions(),
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory.
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => {}
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(_) => {}
            Err(dotenvy::Error::Io(_)) => {
                // No .env file found — that's fine, silently skip
            }
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn cmd_serve(config: AppConfig) -> Result<()> {
    info!("Starting NSA service");

    let store = Arc::new(
        MongoStore::connect(&config.catalog)
            .await
            .context("Failed to connect to the catalog")?,
    );

    // Hydrate the data-source manager from the catalog. A dead data source
    // must not keep the whole service down.
    let datasources = Arc::new(DataSourceManager::new());
    match store.list_datasources().await {
        Ok(list) => {
            for ds in &list {
                if let Err(e) = datasources.add(ds).await {
                    warn!(name = %ds.name, error = %e, "Skipping data source");
                }
            }
        }
        Err(e) => warn!(error = %e, "Failed to list data sources"),
    }

    let registry = Arc::new(ActionRegistry::with_builtins());
    let executor = Arc::new(Executor::new(registry, store.clone(), datasources.clone()));

    let params = ConsumerParams {
        lookupd_addresses: config.bus.lookupd_addresses.clone(),
        ..ConsumerParams::default()
    };
    let transport = Arc::new(InMemoryBus::new());
    let manager = Arc::new(ConsumerManager::new(
        transport,
        executor.clone(),
        store.clone(),
        params,
    ));

    // Initial consumer set, then periodic reconciliation. The admin surface
    // signals reloads out of process; polling stands in for that here.
    reload_from_catalog(&manager, store.as_ref()).await;
    let poller = tokio::spawn({
        let manager = manager.clone();
        let store = store.clone();
        let interval = Duration::from_secs(config.bus.reload_interval_seconds.max(1));
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                reload_from_catalog(&manager, store.as_ref()).await;
            }
        }
    });

    info!(consumers = ?manager.list().await, "NSA service started");

    wait_for_shutdown_signal().await?;
    info!("Shutting down NSA service");

    poller.abort();
    manager.stop().await;
    executor.shutdown().await;
    datasources.close().await;
    store.shutdown().await;

    info!("NSA service stopped");
    Ok(())
}

async fn reload_from_catalog(manager: &ConsumerManager, catalog: &dyn Catalog) {
    match catalog.list_enabled_workflows().await {
        Ok(workflows) => {
            if let Err(e) = manager.reload(&workflows).await {
                error!(error = %e, "Consumer reload failed");
            }
        }
        Err(e) => error!(error = %e, "Failed to list workflows for reload"),
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

fn cmd_check_config(config: AppConfig) -> Result<()> {
    println!("{:#?}", config);
    Ok(())
}

fn cmd_actions() -> Result<()> {
    let registry = ActionRegistry::with_builtins();
    let actions = registry.list();

    println!("{:<16} DESCRIPTION", "ACTION");
    println!("{}", "-".repeat(60));

    for (name, desc) in &actions {
        println!("{:<16} {}", name, desc);
    }

    println!("\nTotal: {} action(s)", actions.len());
    Ok(())
}
