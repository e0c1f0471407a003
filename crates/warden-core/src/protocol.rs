use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Maximum frame size for control-plane RPC (1 MiB).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ============================================================================
// Status codes
// ============================================================================

/// RPC failure classes surfaced to callers. There is no out-of-band error
/// channel; every failure travels back as one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed payload: zero counts, unknown GPU uuid, mismatched vectors.
    InvalidArgument,
    /// No daemon/GPU combination can satisfy the requested memory.
    ResourceExhausted,
    /// Spawn or bookkeeping failure on the serving side.
    Internal,
    /// A downstream RPC target could not be reached.
    Unavailable,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid_argument"),
            Self::ResourceExhausted => write!(f, "resource_exhausted"),
            Self::Internal => write!(f, "internal"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// A typed RPC error carried in response envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceExhausted, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

// ============================================================================
// Message schemas
// ============================================================================

/// Pushed by a daemon once at startup. `free_memory[i]` corresponds to
/// `uuid[i]`; the vectors must be equal length. Memory figures are a snapshot
/// of host enumeration; the manager tracks deltas from here on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonRegisterRequest {
    pub self_address: String,
    pub free_memory: Vec<u64>,
    pub uuid: Vec<String>,
}

/// Manager → daemon: spawn `count` workers pinned to GPU `uuid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSpawnRequest {
    pub count: u32,
    pub uuid: String,
}

/// Worker endpoints in allocation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSpawnReply {
    pub worker_address: Vec<String>,
}

/// Guest → manager: request `worker_count` workers, each needing
/// `gpu_mem[i]` bytes on each of `gpu_count` GPUs. `gpu_mem` and
/// `gpu_count` must agree; only single-GPU workers are currently defined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerAssignRequest {
    pub worker_count: u32,
    pub gpu_count: u32,
    pub gpu_mem: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerAssignReply {
    pub worker_address: Vec<String>,
}

/// Daemon → manager: a supervised worker was reaped. `uuid` is a vector for
/// future multi-GPU workers; currently length 1. Idempotent on the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerExitNotifyRequest {
    pub worker_address: String,
    pub uuid: Vec<String>,
}

// ============================================================================
// Request/response envelopes
// ============================================================================

/// Requests accepted by the manager listener. Daemons send `RegisterDaemon`
/// and `NotifyWorkerExit`; guests send `AssignWorker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManagerRequest {
    RegisterDaemon(DaemonRegisterRequest),
    AssignWorker(WorkerAssignRequest),
    NotifyWorkerExit(WorkerExitNotifyRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManagerResponse {
    Registered,
    Assigned(WorkerAssignReply),
    ExitAcked,
    Error(RpcError),
}

/// Requests accepted by a daemon listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonRequest {
    SpawnWorker(WorkerSpawnRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonResponse {
    Spawned(WorkerSpawnReply),
    Error(RpcError),
}

// ============================================================================
// Frame protocol (length-prefixed JSON)
// ============================================================================

/// Read a length-prefixed JSON frame from a tokio AsyncRead.
pub async fn read_frame<R: tokio::io::AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .with_context(|| "Failed to read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("Frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .with_context(|| "Failed to read frame body")?;

    Ok(buf)
}

/// Write a length-prefixed JSON frame to a tokio AsyncWrite.
pub async fn write_frame<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .with_context(|| "Failed to write frame length")?;
    writer
        .write_all(data)
        .await
        .with_context(|| "Failed to write frame body")?;
    writer
        .flush()
        .await
        .with_context(|| "Failed to flush frame")?;
    Ok(())
}

/// Serialize and send one message.
pub async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(msg).with_context(|| "Failed to serialize message")?;
    write_frame(writer, &data).await
}

/// Read and deserialize one message.
pub async fn recv_message<R, T>(reader: &mut R) -> Result<T>
where
    R: tokio::io::AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).with_context(|| "Failed to deserialize message")
}

// ============================================================================
// Tests
// ============================================================================
