use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use warden_core::protocol::{self, ManagerRequest, ManagerResponse};

use crate::assign::{self, ManagerState};

/// The manager's RPC listener. Both services share it: daemons register and
/// notify exits, guests request workers; dispatch is on the request variant.
pub struct ManagerServer {
    listener: TcpListener,
    state: Arc<ManagerState>,
}

impl ManagerServer {
    pub async fn bind(addr: &str, state: Arc<ManagerState>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind manager listener on {}", addr))?;
        info!(listen = %addr, "Manager service listening");
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .with_context(|| "Failed to read manager listener address")
    }

    /// Accept connections until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let ManagerServer { listener, state } = self;
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(state, stream, peer).await {
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
                    info!("Manager service shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Handle a single connection: read one request, execute, send response.
async fn handle_connection(
    state: Arc<ManagerState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let request: ManagerRequest = protocol::recv_message(&mut reader).await?;
    let response = dispatch(&state, request, peer).await;

    protocol::send_message(&mut writer, &response).await?;
    Ok(())
}

async fn dispatch(
    state: &Arc<ManagerState>,
    request: ManagerRequest,
    peer: SocketAddr,
) -> ManagerResponse {
    match request {
        ManagerRequest::RegisterDaemon(req) => {
            info!(
                peer = %peer,
                daemon = %req.self_address,
                gpu_count = req.uuid.len(),
                "Register request"
            );
            match state.catalogue.register(&req).await {
                Ok(()) => {
                    // Stale slots from a previous registration are dead.
                    state.pool.clear_daemon(&req.self_address).await;
                    if state.pool.enabled() {
                        tokio::spawn(assign::warm_up(
                            Arc::clone(state),
                            req.self_address.clone(),
                        ));
                    }
                    ManagerResponse::Registered
                }
                Err(e) => ManagerResponse::Error(e),
            }
        }
        ManagerRequest::AssignWorker(req) => {
            info!(
                peer = %peer,
                worker_count = req.worker_count,
                gpu_mem = ?req.gpu_mem,
                "Assign request"
            );
            match assign::assign_workers(state, &req).await {
                Ok(reply) => ManagerResponse::Assigned(reply),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Assignment failed");
                    ManagerResponse::Error(e)
                }
            }
        }
        ManagerRequest::NotifyWorkerExit(req) => {
            state.pool.discard_endpoint(&req.worker_address).await;
            state
                .catalogue
                .apply_exit(&req.worker_address, &req.uuid)
                .await;
            ManagerResponse::ExitAcked
        }
    }
}
