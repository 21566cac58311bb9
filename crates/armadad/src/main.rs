//! armadad: the Armada control-plane daemon.
//!
//! Single binary that assembles the control plane:
//! - Ledger (redb)
//! - Scheduler
//! - Orchestrator (operation workflows, deployment reconciliation)
//! - REST API
//!
//! On start it re-drives every operation left in flight by the previous run.
//!
//! # Usage
//!
//! ```text
//! armadad serve --config /etc/armada/armadad.toml --port 8443
//! armadad config --config /etc/armada/armadad.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use armada_scheduler::Scheduler;
use armada_state::{OperationState, StateStore};
use armada_workflow::{InMemoryRuntime, Orchestrator, WorkflowResult};

use crate::config::{DaemonConfig, LogConfig};

#[derive(Parser)]
#[command(name = "armadad", about = "Armada control-plane daemon")]
struct Cli {
    /// Path to armadad.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve {
        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the ledger (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { port, data_dir } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            init_tracing(&config.log);
            serve(config).await
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: DaemonConfig) -> anyhow::Result<()> {
    info!("Armada daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.storage.data_dir)?;
    let db_path = config.storage.db_path();

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "ledger opened");

    let scheduler = Scheduler::new(state.clone(), config.scheduler.clone());
    info!(max_attempts = config.scheduler.max_attempts, "scheduler initialized");

    // No node agent is wired in; placements are tracked in process.
    let runtime = Arc::new(InMemoryRuntime::new());
    warn!("using the in-process placement runtime");

    let orchestrator = Orchestrator::new(state, scheduler, runtime, &config.workflow);
    info!(
        max_attempts = config.workflow.max_attempts,
        poll_ms = config.workflow.signal_poll_interval_ms,
        "orchestrator initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Resume in-flight operations ────────────────────────────

    let resumed = orchestrator.recover()?;
    let recovery_handle = tokio::spawn(watch_recovered(resumed, shutdown_rx));

    // ── Start API server ───────────────────────────────────────

    let router = armada_api::build_router(orchestrator);
    let addr = config.listen_addr()?;

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = recovery_handle.await;

    info!("Armada daemon stopped");
    Ok(())
}

/// Log how resumed operations end, until shutdown. Unfinished ones stay in
/// the ledger and are resumed again on the next start.
async fn watch_recovered(
    handles: Vec<JoinHandle<WorkflowResult<OperationState>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    for handle in handles {
        tokio::select! {
            joined = handle => match joined {
                Ok(Ok(state)) => info!(?state, "resumed operation finished"),
                Ok(Err(e)) => error!(error = %e, "resumed operation aborted"),
                Err(e) => error!(error = %e, "resumed operation panicked"),
            },
            _ = shutdown.changed() => return,
        }
    }
}
