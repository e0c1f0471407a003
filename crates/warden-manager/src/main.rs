use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use warden_core::addr::ServerAddress;
use warden_core::logging::{self, LogFormat};

use warden_daemon::supervise::SpawnSpec;

use warden_manager::assign::ManagerState;
use warden_manager::catalogue::Catalogue;
use warden_manager::daemon_client::TcpSpawnClient;
use warden_manager::legacy::LegacyManager;
use warden_manager::pool::WorkerPool;
use warden_manager::server::ManagerServer;

#[derive(Parser)]
#[command(name = "warden-manager", about = "GPU worker fleet manager")]
struct Cli {
    /// Emit JSON logs instead of human-readable output.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fleet manager: daemons register, guests request workers.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:3334")]
        address: ServerAddress,

        /// Pre-warmed workers kept per daemon.
        #[arg(long, default_value_t = 3)]
        pool_size: usize,

        /// Disable the pre-warm pool entirely.
        #[arg(long)]
        disable_pool: bool,
    },
    /// Run a co-located single-host manager that forks workers directly.
    Legacy {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:3333")]
        address: ServerAddress,

        /// Path to the worker executable.
        #[arg(short = 'w', long, value_name = "WORKER_PATH")]
        worker_path: PathBuf,

        /// Base port for spawned workers.
        #[arg(short = 'b', long, default_value_t = 4000)]
        worker_port_base: u16,

        /// Pre-warmed workers kept locally.
        #[arg(short = 'n', long, default_value_t = 3)]
        pool_size: usize,

        /// Disable the local worker pool.
        #[arg(long)]
        disable_pool: bool,

        /// Extra arguments appended to every worker invocation after the port.
        #[arg(trailing_var_arg = true, value_name = "WORKER_ARGS")]
        worker_args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Human
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;

    match cli.command {
        Command::Serve {
            address,
            pool_size,
            disable_pool,
        } => {
            let capacity = if disable_pool { 0 } else { pool_size };
            rt.block_on(serve(address, capacity))
        }
        Command::Legacy {
            address,
            worker_path,
            worker_port_base,
            pool_size,
            disable_pool,
            worker_args,
        } => {
            let worker_path = std::fs::canonicalize(&worker_path)
                .with_context(|| format!("Worker binary {} not found", worker_path.display()))?;
            let capacity = if disable_pool { 0 } else { pool_size };
            rt.block_on(serve_legacy(
                address,
                worker_path,
                worker_port_base,
                capacity,
                worker_args,
            ))
        }
    }
}

async fn serve(address: ServerAddress, pool_capacity: usize) -> Result<()> {
    let state = Arc::new(ManagerState::new(
        Catalogue::new(),
        WorkerPool::new(pool_capacity),
        Arc::new(TcpSpawnClient::new()),
    ));
    let server = ManagerServer::bind(&address.to_string(), state).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(server.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for ctrl-c")?;
    info!("Shutdown signal received, stopping manager...");
    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    info!("Manager stopped");
    Ok(())
}

async fn serve_legacy(
    address: ServerAddress,
    worker_path: PathBuf,
    worker_port_base: u16,
    pool_capacity: usize,
    worker_args: Vec<String>,
) -> Result<()> {
    let spec = SpawnSpec {
        worker_path,
        worker_args,
        host_ip: address.host().to_string(),
        port_base: worker_port_base,
    };
    let manager = LegacyManager::bind(&address.to_string(), spec, pool_capacity).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(manager.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for ctrl-c")?;
    info!("Shutdown signal received, stopping legacy manager...");
    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    info!("Legacy manager stopped");
    Ok(())
}
