//! ddcloud-server: drive a cloud server toward a declared configuration.
//!
//! Runs one lifecycle operation against the sandbox control plane. The
//! server's record lives in `--state`; the sandbox world is loaded from and
//! written back to `--cloud` so successive runs see each other's effects.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ddcloud_server::clients::SimulatedCloud;
use ddcloud_server::{
    FileStateStore, ReconcilerConfig, ServerLifecycle, ServerRecord, ServerSpec, StateStore,
};

/// ddcloud server reconciler
#[derive(Parser, Debug)]
#[command(name = "ddcloud-server", version, about)]
struct Args {
    /// File holding the server's persisted record
    #[arg(long, default_value = "server-state.json")]
    state: PathBuf,

    /// Sandbox control plane world (created on first use)
    #[arg(long)]
    cloud: Option<PathBuf>,

    /// Server deployment timeout in seconds
    #[arg(long)]
    create_timeout: Option<u64>,

    /// Reconfigure / disk operation timeout in seconds
    #[arg(long)]
    update_timeout: Option<u64>,

    /// Network adapter update timeout in seconds
    #[arg(long)]
    adapter_update_timeout: Option<u64>,

    /// Server delete timeout in seconds
    #[arg(long)]
    delete_timeout: Option<u64>,

    /// Power-off timeout in seconds
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Interval between status polls in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy a new server
    Create {
        /// Desired server configuration (JSON)
        #[arg(long)]
        desired: PathBuf,
    },
    /// Refresh the record from the control plane
    Read,
    /// Move the server to a new desired configuration
    Update {
        #[arg(long)]
        desired: PathBuf,
    },
    /// Power off and delete the server
    Delete,
    /// Show what an update would change
    Plan {
        #[arg(long)]
        desired: PathBuf,
    },
}

impl Args {
    fn config(&self) -> ReconcilerConfig {
        let mut config = ReconcilerConfig::default();
        if let Some(secs) = self.create_timeout {
            config.create_timeout_secs = secs;
        }
        if let Some(secs) = self.update_timeout {
            config.update_timeout_secs = secs;
        }
        if let Some(secs) = self.adapter_update_timeout {
            config.adapter_update_timeout_secs = secs;
        }
        if let Some(secs) = self.delete_timeout {
            config.delete_timeout_secs = secs;
        }
        if let Some(secs) = self.shutdown_timeout {
            config.shutdown_timeout_secs = secs;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ddcloud_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = args.config();

    let cloud = Arc::new(load_cloud(args.cloud.as_deref()).await?);
    let lifecycle = ServerLifecycle::new(cloud.clone(), config);
    let store = FileStateStore::new(&args.state);

    let outcome = run(&lifecycle, &store, args.command).await;

    // Persist the world even when the operation failed part-way.
    if let Some(path) = &args.cloud {
        cloud
            .save(path)
            .await
            .with_context(|| format!("Failed to save sandbox cloud to {}", path.display()))?;
    }

    outcome
}

async fn run(lifecycle: &ServerLifecycle, store: &FileStateStore, command: Command) -> Result<()> {
    match command {
        Command::Create { desired } => {
            let existing = store.load().await.context("Failed to load state")?;
            if let Some(id) = existing.and_then(|r| r.id) {
                bail!("State already tracks server '{}'; delete it first", id);
            }
            let desired = load_desired(&desired).await?;
            let record = lifecycle.create(desired, store).await?;
            print_json(&record)
        }
        Command::Read => {
            let record = require_record(store).await?;
            match lifecycle.read(record, store).await? {
                Some(record) => print_json(&record),
                None => {
                    warn!("Server no longer exists; state cleared");
                    Ok(())
                }
            }
        }
        Command::Update { desired } => {
            let record = require_record(store).await?;
            let desired = load_desired(&desired).await?;
            let record = lifecycle.update(record, desired, store).await?;
            print_json(&record)
        }
        Command::Delete => {
            let record = require_record(store).await?;
            lifecycle.delete(record, store).await?;
            info!("Server deleted");
            Ok(())
        }
        Command::Plan { desired } => {
            let record = require_record(store).await?;
            let desired = load_desired(&desired).await?;
            let plan = lifecycle.plan(&record, &desired).await?;
            if plan.is_empty() {
                info!("No changes");
            }
            print_json(&plan)
        }
    }
}

async fn load_cloud(path: Option<&Path>) -> Result<SimulatedCloud> {
    match path {
        Some(path) if path.exists() => SimulatedCloud::load(path)
            .await
            .with_context(|| format!("Failed to load sandbox cloud from {}", path.display())),
        _ => Ok(SimulatedCloud::sandbox()),
    }
}

async fn load_desired(path: &Path) -> Result<ServerSpec> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("Invalid server configuration in {}", path.display()))
}

async fn require_record(store: &FileStateStore) -> Result<ServerRecord> {
    store
        .load()
        .await
        .context("Failed to load state")?
        .context("No server record in state; run create first")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
