use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use warden_core::protocol::{
    self, ManagerRequest, ManagerResponse, RpcError, WorkerAssignReply, WorkerAssignRequest,
};

use warden_daemon::supervise::{ExitSink, SpawnSpec, WorkerSpawner};

/// Worker exits in legacy mode never leave the process: the sink just
/// retires any pooled endpoint for the dead worker.
struct LocalExitSink {
    pool: Arc<Mutex<VecDeque<String>>>,
}

#[async_trait]
impl ExitSink for LocalExitSink {
    async fn notify_worker_exit(&self, endpoint: &str, _uuid: &str) -> Result<()> {
        let mut pool = self.pool.lock().await;
        if let Some(pos) = pool.iter().position(|e| e == endpoint) {
            pool.remove(pos);
            info!(endpoint, "Retired pooled worker after exit");
        } else {
            info!(endpoint, "Worker exited");
        }
        Ok(())
    }
}

struct LegacyInner {
    spawner: Arc<WorkerSpawner>,
    pool: Arc<Mutex<VecDeque<String>>>,
    pool_size: usize,
}

/// Co-located single-host manager: no registration, no remote placement,
/// no GPU accounting. `AssignWorker` is satisfied by forking locally.
/// Same wire API as the fleet manager, with an optional local worker pool.
pub struct LegacyManager {
    listener: TcpListener,
    inner: Arc<LegacyInner>,
}

impl LegacyManager {
    /// Bind the listener and pre-warm the local pool (`pool_size` zero
    /// disables it).
    pub async fn bind(addr: &str, spec: SpawnSpec, pool_size: usize) -> Result<Self> {
        let pool = Arc::new(Mutex::new(VecDeque::new()));
        let spawner = WorkerSpawner::new(
            spec,
            Arc::new(LocalExitSink {
                pool: Arc::clone(&pool),
            }),
        );

        let inner = Arc::new(LegacyInner {
            spawner,
            pool,
            pool_size,
        });

        for _ in 0..pool_size {
            match inner.spawner.spawn_batch(1, "").await {
                Ok(endpoints) => {
                    inner.pool.lock().await.extend(endpoints);
                }
                Err(e) => {
                    warn!(error = %e, "Pool pre-warm spawn failed");
                    break;
                }
            }
        }

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind legacy manager listener on {}", addr))?;
        info!(
            listen = %addr,
            pool_size,
            "Legacy manager listening"
        );
        Ok(Self { listener, inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .with_context(|| "Failed to read legacy manager listener address")
    }

    /// Accept connections until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let LegacyManager { listener, inner } = self;
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let inner = Arc::clone(&inner);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(inner, stream).await {
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
                    info!("Legacy manager shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(inner: Arc<LegacyInner>, stream: TcpStream) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let request: ManagerRequest = protocol::recv_message(&mut reader).await?;

    let response = match request {
        ManagerRequest::AssignWorker(req) => match handle_assign(&inner, &req).await {
            Ok(reply) => ManagerResponse::Assigned(reply),
            Err(e) => ManagerResponse::Error(e),
        },
        ManagerRequest::RegisterDaemon(_) => ManagerResponse::Error(RpcError::invalid_argument(
            "Daemon registration is not supported in legacy mode",
        )),
        ManagerRequest::NotifyWorkerExit(req) => {
            let mut pool = inner.pool.lock().await;
            if let Some(pos) = pool.iter().position(|e| *e == req.worker_address) {
                pool.remove(pos);
            }
            ManagerResponse::ExitAcked
        }
    };

    protocol::send_message(&mut writer, &response).await?;
    Ok(())
}

async fn handle_assign(
    inner: &LegacyInner,
    req: &WorkerAssignRequest,
) -> Result<WorkerAssignReply, RpcError> {
    if req.worker_count == 0 {
        return Err(RpcError::invalid_argument("Zero worker count"));
    }

    let mut endpoints = Vec::with_capacity(req.worker_count as usize);
    let mut remaining = req.worker_count;

    // Hand out pooled workers first, backfilling one each asynchronously.
    while remaining > 0 {
        let Some(endpoint) = inner.pool.lock().await.pop_front() else {
            break;
        };
        info!(endpoint = %endpoint, "Assigning pooled worker");
        endpoints.push(endpoint);
        remaining -= 1;

        let spawner = Arc::clone(&inner.spawner);
        let pool = Arc::clone(&inner.pool);
        let pool_size = inner.pool_size;
        tokio::spawn(async move {
            match spawner.spawn_batch(1, "").await {
                Ok(new_endpoints) => {
                    let mut pool = pool.lock().await;
                    if pool.len() < pool_size {
                        pool.extend(new_endpoints);
                    }
                }
                Err(e) => warn!(error = %e, "Pool backfill spawn failed"),
            }
        });
    }

    if remaining > 0 {
        endpoints.extend(inner.spawner.spawn_batch(remaining, "").await?);
    }

    Ok(WorkerAssignReply {
        worker_address: endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn sh_spec(port_base: u16) -> SpawnSpec {
        SpawnSpec {
            worker_path: PathBuf::from("/bin/sh"),
            worker_args: vec![],
            host_ip: "127.0.0.1".to_string(),
            port_base,
        }
    }

    async fn roundtrip(addr: SocketAddr, req: &ManagerRequest) -> ManagerResponse {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        protocol::send_message(&mut writer, req).await.unwrap();
        writer.shutdown().await.unwrap();
        protocol::recv_message(&mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn test_assign_spawns_directly_without_pool() {
        let manager = LegacyManager::bind("127.0.0.1:0", sh_spec(9000), 0)
            .await
            .unwrap();
        let addr = manager.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(manager.run(rx));

        let resp = roundtrip(
            addr,
            &ManagerRequest::AssignWorker(WorkerAssignRequest {
                worker_count: 2,
                gpu_count: 1,
                gpu_mem: vec![0],
            }),
        )
        .await;
        match resp {
            ManagerResponse::Assigned(reply) => {
                assert_eq!(
                    reply.worker_address,
                    vec!["127.0.0.1:9000", "127.0.0.1:9001"]
                );
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pool_consumed_head_first() {
        // The port doubles as sleep's duration argument, so the two
        // pre-warmed workers stay alive for a couple of seconds.
        let spec = SpawnSpec {
            worker_path: PathBuf::from("/bin/sleep"),
            worker_args: vec![],
            host_ip: "127.0.0.1".to_string(),
            port_base: 2,
        };
        let manager = LegacyManager::bind("127.0.0.1:0", spec, 2).await.unwrap();
        let addr = manager.local_addr().unwrap();
        assert_eq!(manager.inner.pool.lock().await.len(), 2);

        let (_tx, rx) = watch::channel(false);
        tokio::spawn(manager.run(rx));

        let resp = roundtrip(
            addr,
            &ManagerRequest::AssignWorker(WorkerAssignRequest {
                worker_count: 1,
                gpu_count: 1,
                gpu_mem: vec![0],
            }),
        )
        .await;
        match resp {
            ManagerResponse::Assigned(reply) => {
                // Head of the FIFO: the first pre-warmed worker.
                assert_eq!(reply.worker_address, vec!["127.0.0.1:2"]);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_rejected_in_legacy_mode() {
        let manager = LegacyManager::bind("127.0.0.1:0", sh_spec(9200), 0)
            .await
            .unwrap();
        let addr = manager.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(manager.run(rx));

        let resp = roundtrip(
            addr,
            &ManagerRequest::RegisterDaemon(warden_core::protocol::DaemonRegisterRequest {
                self_address: "0.0.0.0:3335".to_string(),
                free_memory: vec![1],
                uuid: vec!["GPU-a".to_string()],
            }),
        )
        .await;
        match resp {
            ManagerResponse::Error(e) => {
                assert_eq!(e.code, warden_core::protocol::ErrorCode::InvalidArgument);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exited_pooled_worker_is_retired() {
        let manager = LegacyManager::bind("127.0.0.1:0", sh_spec(9300), 2)
            .await
            .unwrap();
        // sh workers exit instantly; the local exit sink empties the pool.
        for _ in 0..200 {
            if manager.inner.pool.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.inner.pool.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_worker_count_rejected() {
        let manager = LegacyManager::bind("127.0.0.1:0", sh_spec(9400), 0)
            .await
            .unwrap();
        let addr = manager.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(manager.run(rx));

        let resp = roundtrip(
            addr,
            &ManagerRequest::AssignWorker(WorkerAssignRequest {
                worker_count: 0,
                gpu_count: 1,
                gpu_mem: vec![0],
            }),
        )
        .await;
        match resp {
            ManagerResponse::Error(e) => {
                assert_eq!(e.code, warden_core::protocol::ErrorCode::InvalidArgument);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
