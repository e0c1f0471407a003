use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use warden_core::protocol::{
    self, DaemonRequest, DaemonResponse, RpcError, WorkerSpawnRequest,
};

/// Client side of the daemon's `SpawnWorker` RPC. A trait so assignment
/// logic can be exercised against a mock fleet.
#[async_trait]
pub trait SpawnClient: Send + Sync {
    /// Spawn `count` workers on `uuid` at the given daemon. Transport-level
    /// failures surface as `Unavailable` and are not retried here; the
    /// guest retries the whole assignment.
    async fn spawn_worker(
        &self,
        daemon_address: &str,
        count: u32,
        uuid: &str,
    ) -> Result<Vec<String>, RpcError>;
}

/// Connect-per-request TCP implementation.
#[derive(Debug, Default)]
pub struct TcpSpawnClient;

impl TcpSpawnClient {
    pub fn new() -> Self {
        Self
    }

    async fn call(&self, daemon_address: &str, req: &DaemonRequest) -> Result<DaemonResponse> {
        let stream = TcpStream::connect(daemon_address)
            .await
            .with_context(|| format!("Failed to connect to daemon at {}", daemon_address))?;
        let (mut reader, mut writer) = stream.into_split();

        protocol::send_message(&mut writer, req).await?;
        writer
            .shutdown()
            .await
            .with_context(|| "Failed to shutdown write half")?;

        protocol::recv_message(&mut reader).await
    }
}

#[async_trait]
impl SpawnClient for TcpSpawnClient {
    async fn spawn_worker(
        &self,
        daemon_address: &str,
        count: u32,
        uuid: &str,
    ) -> Result<Vec<String>, RpcError> {
        let req = DaemonRequest::SpawnWorker(WorkerSpawnRequest {
            count,
            uuid: uuid.to_string(),
        });
        match self.call(daemon_address, &req).await {
            Ok(DaemonResponse::Spawned(reply)) => Ok(reply.worker_address),
            Ok(DaemonResponse::Error(e)) => Err(e),
            Err(e) => Err(RpcError::unavailable(format!(
                "Daemon {} unreachable: {:#}",
                daemon_address, e
            ))),
        }
    }
}
