use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use warden_core::protocol::{
    self, DaemonRequest, DaemonResponse, RpcError, WorkerSpawnReply, WorkerSpawnRequest,
};
use warden_core::provision::GpuProvisioner;

use crate::supervise::WorkerSpawner;

/// State shared by all connection handlers.
struct DaemonService {
    spawner: Arc<WorkerSpawner>,
    provisioner: GpuProvisioner,
}

/// The daemon's RPC server: one operation, `SpawnWorker`.
pub struct DaemonServer {
    listener: TcpListener,
    service: Arc<DaemonService>,
}

impl DaemonServer {
    /// Bind the listener. `provisioner` defines the GPU set spawn requests
    /// are validated against.
    pub async fn bind(
        addr: &str,
        spawner: Arc<WorkerSpawner>,
        provisioner: GpuProvisioner,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind daemon listener on {}", addr))?;
        info!(listen = %addr, "Daemon service listening");
        Ok(Self {
            listener,
            service: Arc::new(DaemonService {
                spawner,
                provisioner,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .with_context(|| "Failed to read daemon listener address")
    }

    /// Accept connections until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let DaemonServer { listener, service } = self;
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let service = Arc::clone(&service);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(service, stream, peer).await {
                                    warn!(peer = %peer, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Daemon service shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Handle a single connection: read one request, execute, send response.
async fn handle_connection(
    service: Arc<DaemonService>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let request: DaemonRequest = protocol::recv_message(&mut reader).await?;
    let DaemonRequest::SpawnWorker(req) = request;

    info!(
        peer = %peer,
        count = req.count,
        uuid = %req.uuid,
        "Spawn request"
    );

    let response = match handle_spawn(&service, &req).await {
        Ok(reply) => DaemonResponse::Spawned(reply),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Spawn request failed");
            DaemonResponse::Error(e)
        }
    };

    protocol::send_message(&mut writer, &response).await?;
    Ok(())
}

async fn handle_spawn(
    service: &DaemonService,
    req: &WorkerSpawnRequest,
) -> Result<WorkerSpawnReply, RpcError> {
    if req.count == 0 {
        return Err(RpcError::invalid_argument("Zero worker count"));
    }
    if req.uuid.is_empty() {
        return Err(RpcError::invalid_argument("Empty GPU uuid"));
    }
    if service.provisioner.find(&req.uuid).is_none() {
        return Err(RpcError::invalid_argument(format!(
            "Unknown GPU uuid {}",
            req.uuid
        )));
    }

    let worker_address = service.spawner.spawn_batch(req.count, &req.uuid).await?;
    Ok(WorkerSpawnReply { worker_address })
}
