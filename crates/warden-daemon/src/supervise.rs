use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use warden_core::protocol::RpcError;
use warden_core::retry;

/// Attempts for the upstream exit notification before dropping it.
const NOTIFY_ATTEMPTS: u32 = 5;
/// Base backoff delay, doubled per attempt.
const NOTIFY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upstream sink for worker-exit notifications. The fleet daemon hands in a
/// manager RPC client; the legacy co-located manager hands in a local sink.
#[async_trait]
pub trait ExitSink: Send + Sync {
    async fn notify_worker_exit(&self, endpoint: &str, uuid: &str) -> Result<()>;
}

/// Static spawn parameters, resolved once from configuration.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Worker executable (canonicalized).
    pub worker_path: PathBuf,
    /// Extra arguments appended after the port.
    pub worker_args: Vec<String>,
    /// Host half of every worker endpoint this spawner produces.
    pub host_ip: String,
    /// Workers listen on `port_base + worker_id`.
    pub port_base: u16,
}

struct WorkerHandle {
    pid: Option<u32>,
    gpu_uuid: String,
}

/// Forks worker processes and supervises them until reap.
///
/// Ports are allocated from a monotonically increasing counter for the
/// spawner's lifetime; no recycling. Each live worker has exactly one
/// supervisor task blocked on its exit, which erases its own port-map entry
/// (never another's) and fires the upstream notification with backoff.
pub struct WorkerSpawner {
    spec: SpawnSpec,
    next_worker_id: AtomicU32,
    workers: Arc<Mutex<HashMap<u16, WorkerHandle>>>,
    exit_sink: Arc<dyn ExitSink>,
}

impl WorkerSpawner {
    pub fn new(spec: SpawnSpec, exit_sink: Arc<dyn ExitSink>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            next_worker_id: AtomicU32::new(0),
            workers: Arc::new(Mutex::new(HashMap::new())),
            exit_sink,
        })
    }

    /// The endpoint a worker on `port` is reachable at.
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}:{}", self.spec.host_ip, port)
    }

    fn next_port(&self) -> u16 {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        self.spec.port_base.wrapping_add(id as u16)
    }

    /// Spawn `count` workers pinned to `gpu_uuid`, all-or-nothing.
    ///
    /// Endpoints are returned in allocation order as soon as every fork has
    /// succeeded; worker readiness is not awaited (early guests retry). If
    /// any fork fails, the children already forked in this batch are killed
    /// and reaped before the call fails: no partial endpoints escape and
    /// no exit notification fires for them.
    pub async fn spawn_batch(&self, count: u32, gpu_uuid: &str) -> Result<Vec<String>, RpcError> {
        let mut forked: Vec<(u16, Child)> = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let port = self.next_port();
            match self.fork_worker(port, gpu_uuid) {
                Ok(child) => forked.push((port, child)),
                Err(e) => {
                    error!(port, error = %e, "Worker spawn failed, aborting batch");
                    for (p, mut child) in forked {
                        if let Err(kill_err) = child.start_kill() {
                            warn!(port = p, error = %kill_err, "Failed to kill aborted worker");
                        }
                        let _ = child.wait().await;
                    }
                    return Err(RpcError::internal(format!(
                        "spawn failed at port {}: {}",
                        port, e
                    )));
                }
            }
        }

        let mut endpoints = Vec::with_capacity(forked.len());
        for (port, child) in forked {
            endpoints.push(self.endpoint(port));
            self.supervise(port, gpu_uuid.to_string(), child).await;
        }
        Ok(endpoints)
    }

    fn fork_worker(&self, port: u16, gpu_uuid: &str) -> Result<Child> {
        info!(port, uuid = %gpu_uuid, "Spawning worker");
        let mut cmd = Command::new(&self.spec.worker_path);
        cmd.arg(port.to_string()).args(&self.spec.worker_args);
        // An empty uuid means no pinning (legacy co-located mode).
        if !gpu_uuid.is_empty() {
            cmd.env("CUDA_VISIBLE_DEVICES", gpu_uuid);
        }
        cmd.env("WARDEN_CHANNEL", "TCP");
        cmd.spawn().with_context(|| {
            format!(
                "Failed to spawn worker {} on port {}",
                self.spec.worker_path.display(),
                port
            )
        })
    }

    /// Register the port-map entry and start the supervisor task.
    async fn supervise(&self, port: u16, gpu_uuid: String, mut child: Child) {
        let pid = child.id();
        self.workers.lock().await.insert(
            port,
            WorkerHandle {
                pid,
                gpu_uuid: gpu_uuid.clone(),
            },
        );

        let workers = Arc::clone(&self.workers);
        let sink = Arc::clone(&self.exit_sink);
        let endpoint = self.endpoint(port);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!(port, pid, status = %status, "Worker exited");
                }
                Err(e) => {
                    warn!(port, pid, error = %e, "Failed to reap worker");
                }
            }

            workers.lock().await.remove(&port);

            let result = retry::retry(
                NOTIFY_ATTEMPTS,
                NOTIFY_BASE_DELAY,
                "worker exit notification",
                || sink.notify_worker_exit(&endpoint, &gpu_uuid),
            )
            .await;
            if let Err(e) = result {
                error!(
                    endpoint = %endpoint,
                    error = %e,
                    "Dropping worker exit notification after retries"
                );
            }
        });
    }

    /// Live workers as `(port, gpu_uuid, pid)` triples.
    pub async fn live_workers(&self) -> Vec<(u16, String, Option<u32>)> {
        let workers = self.workers.lock().await;
        let mut out: Vec<_> = workers
            .iter()
            .map(|(port, h)| (*port, h.gpu_uuid.clone(), h.pid))
            .collect();
        out.sort_by_key(|(port, _, _)| *port);
        out
    }

    pub async fn live_worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}
