//! fleetd — the fleetgrid orchestrator daemon.
//!
//! Single process that runs:
//! - Instance registry + group store (redb)
//! - Container lifecycle (memory or docker runtime)
//! - Health monitor
//! - Autoscaler
//! - Agent/proxy control server (TCP)
//! - REST management API
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleetgrid/fleet.toml
//! fleetd check --config fleet.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleetd::Fleet;
use fleetgrid_core::{FleetConfig, RuntimeKind};
use fleetgrid_lifecycle::{ContainerRuntime, MemoryRuntime};
use fleetgrid_state::GroupStore;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid orchestrator daemon")]
struct Cli {
    /// Path to fleet.toml.
    #[arg(long, short, global = true, default_value = "fleet.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator.
    Run,
    /// Validate the configuration and exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = FleetConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Check => {
            info!(
                path = %cli.config.display(),
                groups = config.groups.len(),
                "configuration is valid"
            );
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,fleetd=debug,fleetgrid=debug".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: FleetConfig) -> anyhow::Result<()> {
    info!("fleetgrid daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    if let Some(parent) = config.store.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let store = GroupStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "group store opened");

    let runtime = container_runtime(config.lifecycle.runtime)?;
    let fleet = Fleet::assemble(&config, store, runtime)?;
    info!(groups = fleet.registry.group_names().len(), "subsystems initialized");

    fleet.reconcile().await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let control = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding control listener {}", config.server.listen))?;
    if config.server.token.is_none() {
        warn!("no server token configured, agents are not authenticated");
    }
    let tasks = fleet.start(control, shutdown_rx.clone());

    // ── Start API server ───────────────────────────────────────

    if config.api.enabled {
        let router = fleetgrid_api::build_router(fleet.api_state());
        let listener = TcpListener::bind(&config.api.listen)
            .await
            .with_context(|| format!("binding api listener {}", config.api.listen))?;
        info!(addr = %config.api.listen, "API server starting");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await?;
    } else {
        info!("API server disabled");
        shutdown_signal(shutdown_tx).await;
    }

    tasks.join().await;
    info!("fleetgrid daemon stopped");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for CTRL+C");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

fn container_runtime(kind: RuntimeKind) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    match kind {
        RuntimeKind::Memory => {
            info!("using in-memory container runtime");
            Ok(Arc::new(MemoryRuntime::new()))
        }
        #[cfg(feature = "docker")]
        RuntimeKind::Docker => {
            let docker = fleetgrid_lifecycle::DockerRuntime::connect()?;
            info!("connected to docker");
            Ok(Arc::new(docker))
        }
        #[cfg(not(feature = "docker"))]
        RuntimeKind::Docker => {
            anyhow::bail!("lifecycle.runtime = \"docker\" requires fleetd built with --features docker")
        }
    }
}
