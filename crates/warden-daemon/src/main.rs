use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use warden_core::addr::ServerAddress;
use warden_core::logging::{self, LogFormat};
use warden_core::provision::GpuProvisioner;
use warden_core::retry;

use warden_daemon::config::{
    self, DEFAULT_DAEMON_ADDRESS, DEFAULT_MANAGER_ADDRESS, DaemonConfig,
};
use warden_daemon::manager_client::ManagerClient;
use warden_daemon::probe::{self, FixedProbe, GpuProbe, NvmlProbe};
use warden_daemon::server::DaemonServer;
use warden_daemon::supervise::{SpawnSpec, WorkerSpawner};

#[derive(Parser)]
#[command(name = "warden-daemon", about = "Per-host GPU worker daemon")]
struct Cli {
    /// GPU config file: one `key=<uuid>` descriptor per line.
    #[arg(short = 'f', value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Path to the worker executable.
    #[arg(short = 'w', value_name = "WORKER_PATH")]
    worker_path: PathBuf,

    /// Manager address.
    #[arg(short = 'm', value_name = "MANAGER_ADDRESS", default_value = DEFAULT_MANAGER_ADDRESS)]
    manager_address: ServerAddress,

    /// Address this daemon listens on and advertises.
    #[arg(short = 'd', value_name = "DAEMON_ADDRESS", default_value = DEFAULT_DAEMON_ADDRESS)]
    daemon_address: ServerAddress,

    /// Base port for spawned workers.
    #[arg(short = 'b', value_name = "WORKER_PORT_BASE", default_value_t = config::DEFAULT_WORKER_PORT_BASE)]
    worker_port_base: u16,

    /// Pre-warm worker pool size (advisory; the manager decides).
    #[arg(short = 'n', value_name = "WORKER_POOL_SIZE", default_value_t = config::DEFAULT_WORKER_POOL_SIZE)]
    worker_pool_size: u32,

    /// Report every configured GPU with this fixed memory size instead of
    /// querying the driver. For driverless hosts and development.
    #[arg(long, value_name = "BYTES")]
    fixed_gpu_memory: Option<u64>,

    /// Emit JSON logs instead of human-readable output.
    #[arg(long)]
    json_logs: bool,

    /// Extra arguments appended to every worker invocation after the port.
    #[arg(trailing_var_arg = true, value_name = "WORKER_ARGS")]
    worker_args: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Human
    });

    let worker_path = std::fs::canonicalize(&cli.worker_path)
        .with_context(|| format!("Worker binary {} not found", cli.worker_path.display()))?;

    let config = DaemonConfig {
        gpu_config_file: cli.config_file,
        worker_path,
        daemon_address: cli.daemon_address,
        manager_address: cli.manager_address,
        worker_port_base: cli.worker_port_base,
        worker_pool_size: cli.worker_pool_size,
        worker_args: cli.worker_args,
    };

    let uuids = config::parse_gpu_config(&config.gpu_config_file)?;
    let probe: Box<dyn GpuProbe> = match cli.fixed_gpu_memory {
        Some(bytes) => Box::new(FixedProbe::uniform(&uuids, bytes)),
        None => Box::new(NvmlProbe::init()?),
    };
    let gpus = probe::enumerate_gpus(probe.as_ref(), &uuids)?;
    config.log_summary(&gpus);

    let provisioner = GpuProvisioner::new(
        gpus.iter().map(|g| g.uuid.clone()).collect(),
        gpus.iter().map(|g| g.free_memory).collect(),
    )?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;
    rt.block_on(run(config, provisioner))
}

async fn run(config: DaemonConfig, provisioner: GpuProvisioner) -> Result<()> {
    let snapshot = provisioner.snapshot();

    let client = Arc::new(ManagerClient::new(config.manager_address.to_string()));
    let spawner = WorkerSpawner::new(
        SpawnSpec {
            worker_path: config.worker_path.clone(),
            worker_args: config.worker_args.clone(),
            host_ip: config.daemon_address.host().to_string(),
            port_base: config.worker_port_base,
        },
        Arc::clone(&client) as Arc<dyn warden_daemon::supervise::ExitSink>,
    );

    let server = DaemonServer::bind(&config.daemon_address.to_string(), spawner, provisioner)
        .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(server.run(shutdown_rx));

    // Register once the listener is up. A manager restart implies full
    // re-registration, so startup keeps going even if this fails now.
    let self_address = config.daemon_address.to_string();
    let register = retry::retry(5, Duration::from_millis(500), "daemon registration", || {
        client.register_daemon(&self_address, &snapshot)
    })
    .await;
    if let Err(e) = register {
        warn!(
            manager = %config.manager_address,
            error = %e,
            "Could not register with manager, serving anyway"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for ctrl-c")?;

    info!("Shutdown signal received, stopping daemon...");
    let _ = shutdown_tx.send(true);
    let _ = server_handle.await;

    info!("Daemon stopped");
    Ok(())
}
