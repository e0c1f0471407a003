use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use warden_core::addr::ServerAddress;
use warden_core::gpu::GpuInfo;

pub const DEFAULT_MANAGER_ADDRESS: &str = "0.0.0.0:3334";
pub const DEFAULT_DAEMON_ADDRESS: &str = "0.0.0.0:3335";
pub const DEFAULT_WORKER_PORT_BASE: u16 = 4000;
pub const DEFAULT_WORKER_POOL_SIZE: u32 = 3;

/// Fully resolved daemon configuration. Built once in main and passed
/// explicitly to the server and the spawner; there is no process-wide
/// configuration singleton.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// GPU descriptor file: one `key=<uuid>` line per provisioned GPU.
    pub gpu_config_file: PathBuf,
    /// Canonicalized path to the worker executable.
    pub worker_path: PathBuf,
    /// Address this daemon listens on and advertises to the manager.
    pub daemon_address: ServerAddress,
    /// Address of the fleet manager.
    pub manager_address: ServerAddress,
    /// Workers listen on `worker_port_base + worker_id`.
    pub worker_port_base: u16,
    /// Advisory pre-warm pool size; the spawn-ahead decision is the
    /// manager's, this value is surfaced in the startup summary.
    pub worker_pool_size: u32,
    /// Extra arguments appended to every worker invocation after the port.
    pub worker_args: Vec<String>,
}

impl DaemonConfig {
    /// Log the effective configuration at startup.
    pub fn log_summary(&self, gpus: &[GpuInfo]) {
        info!(
            manager = %self.manager_address,
            daemon = %self.daemon_address,
            worker = %self.worker_path.display(),
            worker_port_base = self.worker_port_base,
            worker_pool_size = self.worker_pool_size,
            gpu_count = gpus.len(),
            "Daemon configuration"
        );
        for (i, gpu) in gpus.iter().enumerate() {
            info!(
                gpu = i,
                uuid = %gpu.uuid,
                total_memory = gpu.total_memory,
                free_memory = gpu.free_memory,
                "Provisioned GPU"
            );
        }
    }
}

/// Parse the GPU descriptor file: newline-delimited `key=<uuid>` entries.
/// Blank lines and `#` comments are skipped; a line without `=` or with an
/// empty uuid is rejected.
pub fn parse_gpu_config(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read GPU config file {}", path.display()))?;

    let mut uuids = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((_, uuid)) = line.split_once('=') else {
            bail!(
                "{}:{}: GPU descriptor '{}' is missing '='",
                path.display(),
                lineno + 1,
                line
            );
        };
        let uuid = uuid.trim();
        if uuid.is_empty() {
            bail!(
                "{}:{}: GPU descriptor has an empty uuid",
                path.display(),
                lineno + 1
            );
        }
        uuids.push(uuid.to_string());
    }

    if uuids.is_empty() {
        bail!("GPU config file {} lists no GPUs", path.display());
    }
    Ok(uuids)
}
