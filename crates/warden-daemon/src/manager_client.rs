use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::info;

use warden_core::gpu::GpuInfo;
use warden_core::protocol::{
    self, DaemonRegisterRequest, ManagerRequest, ManagerResponse, WorkerExitNotifyRequest,
};

use crate::supervise::ExitSink;

/// Client for the fleet manager's RPC service.
///
/// Opens a new connection per request (simple, reliable); the manager
/// handles one request per connection. Supervisors receive this client as a
/// collaborator at spawner construction, so there is no global lookup.
pub struct ManagerClient {
    manager_address: String,
}

impl ManagerClient {
    pub fn new(manager_address: impl Into<String>) -> Self {
        Self {
            manager_address: manager_address.into(),
        }
    }

    async fn call(&self, req: &ManagerRequest) -> Result<ManagerResponse> {
        let stream = TcpStream::connect(&self.manager_address)
            .await
            .with_context(|| format!("Failed to connect to manager at {}", self.manager_address))?;
        let (mut reader, mut writer) = stream.into_split();

        protocol::send_message(&mut writer, req).await?;

        // Shutdown write half to signal we're done sending
        writer
            .shutdown()
            .await
            .with_context(|| "Failed to shutdown write half")?;

        protocol::recv_message(&mut reader).await
    }

    /// Announce this daemon and its GPU snapshot. Called once at startup.
    pub async fn register_daemon(&self, self_address: &str, gpus: &[GpuInfo]) -> Result<()> {
        let req = ManagerRequest::RegisterDaemon(DaemonRegisterRequest {
            self_address: self_address.to_string(),
            free_memory: gpus.iter().map(|g| g.free_memory).collect(),
            uuid: gpus.iter().map(|g| g.uuid.clone()).collect(),
        });
        match self.call(&req).await? {
            ManagerResponse::Registered => {
                info!(manager = %self.manager_address, "Registered with manager");
                Ok(())
            }
            ManagerResponse::Error(e) => Err(anyhow::Error::new(e)),
            other => bail!("Unexpected response to RegisterDaemon: {:?}", other),
        }
    }
}

#[async_trait]
impl ExitSink for ManagerClient {
    async fn notify_worker_exit(&self, endpoint: &str, uuid: &str) -> Result<()> {
        let req = ManagerRequest::NotifyWorkerExit(WorkerExitNotifyRequest {
            worker_address: endpoint.to_string(),
            uuid: vec![uuid.to_string()],
        });
        match self.call(&req).await? {
            ManagerResponse::ExitAcked => Ok(()),
            ManagerResponse::Error(e) => Err(anyhow::Error::new(e)),
            other => bail!("Unexpected response to NotifyWorkerExit: {:?}", other),
        }
    }
}
