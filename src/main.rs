//! # Syncflow Orchestrator
//!
//! Runs the task orchestrator: the HTTP API workers and clients talk to, and
//! the scheduler loop that materializes schedules and reclaims stale leases.
//!
//! Usage:
//!   syncflow                          # Serve on 0.0.0.0:3008
//!   syncflow --port 8080              # Custom port
//!   syncflow --db-path ./orch.db      # Custom store
//!   syncflow --no-scheduler           # API replica without the loop

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use syncflow_core::OrchestratorConfig;
use syncflow_scheduler::{Orchestrator, spawn_scheduler};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "syncflow",
    version,
    about = "⏱️ Syncflow: task orchestrator for connector syncs, actions and webhooks"
)]
struct Cli {
    /// Config file (default: $SYNCFLOW_CONFIG or ~/.syncflow/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// API port
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite store path (`:memory:` for a throwaway store)
    #[arg(long)]
    db_path: Option<String>,

    /// Scheduler tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Serve the API only; another replica runs the scheduler loop
    #[arg(long)]
    no_scheduler: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = &self.db_path {
            config.store.path = path.clone();
        }
        if let Some(tick) = self.tick_ms {
            config.scheduler.tick_interval_ms = tick;
        }
        if self.no_scheduler {
            config.scheduler.enabled = false;
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose {
        "syncflow=debug,syncflow_scheduler=debug,syncflow_gateway=debug,tower_http=debug"
    } else {
        "syncflow=info,syncflow_scheduler=info,syncflow_gateway=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load_from(path)?,
        None => OrchestratorConfig::load()?,
    };
    cli.apply(&mut config);

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
    tracing::info!("🚀 Syncflow v{} starting", env!("CARGO_PKG_VERSION"));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if config.scheduler.enabled {
        Some(spawn_scheduler(
            orchestrator.clone(),
            Duration::from_millis(config.scheduler.tick_interval_ms.max(1)),
            shutdown_rx.clone(),
        ))
    } else {
        tracing::info!("⏸️ Scheduler loop disabled on this replica");
        None
    };

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("🛑 Shutdown requested"),
            Err(e) => {
                tracing::warn!("⚠️ Cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        }
        shutdown_tx.send(true).ok();
    });

    let mut server_rx = shutdown_rx;
    let server_shutdown = async move {
        server_rx.wait_for(|stop| *stop).await.ok();
    };
    syncflow_gateway::start(orchestrator, config.server, server_shutdown).await?;

    if let Some(handle) = scheduler {
        handle.await.ok();
    }
    tracing::info!("👋 Syncflow stopped");
    Ok(())
}
