use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use warden_core::protocol::{ErrorCode, RpcError, WorkerAssignReply, WorkerAssignRequest};

use crate::catalogue::{Catalogue, SlotReserve};
use crate::daemon_client::SpawnClient;
use crate::placement::Assignment;
use crate::pool::{PoolSlot, WorkerPool};

/// Everything the manager's request handlers share.
pub struct ManagerState {
    pub catalogue: Catalogue,
    pub pool: WorkerPool,
    pub spawn_client: Arc<dyn SpawnClient>,
}

impl ManagerState {
    pub fn new(catalogue: Catalogue, pool: WorkerPool, spawn_client: Arc<dyn SpawnClient>) -> Self {
        Self {
            catalogue,
            pool,
            spawn_client,
        }
    }
}

/// Satisfy a guest's `AssignWorker` request.
///
/// Pre-warmed slots are consumed first (each charged with the requested
/// reservation and backfilled asynchronously). The remainder goes through
/// placement: reserve under the catalogue lock, fan spawn RPCs out in
/// parallel, roll back on failure. Endpoints are returned in consumption
/// order followed by plan order.
pub async fn assign_workers(
    state: &Arc<ManagerState>,
    req: &WorkerAssignRequest,
) -> Result<WorkerAssignReply, RpcError> {
    if req.worker_count == 0 {
        return Err(RpcError::invalid_argument("Zero worker count"));
    }
    if req.gpu_count as usize != req.gpu_mem.len() {
        return Err(RpcError::invalid_argument(
            "Mismatched gpu_count/gpu_mem vector lengths",
        ));
    }
    if req.gpu_count != 1 {
        return Err(RpcError::invalid_argument(
            "Only single-GPU workers are supported",
        ));
    }
    let memory = req.gpu_mem[0];

    let mut endpoints = Vec::with_capacity(req.worker_count as usize);
    let mut consumed: Vec<PoolSlot> = Vec::new();
    let mut remaining = req.worker_count;

    // Draw from the pre-warm pool first. Bounded by the pool size observed
    // up front so bypassed slots cannot be re-examined forever.
    let mut attempts = state.pool.total_len().await;
    while remaining > 0 && attempts > 0 {
        attempts -= 1;
        let Some(slot) = state.pool.pop().await else {
            break;
        };
        match state
            .catalogue
            .reserve_for_slot(&slot.daemon_address, &slot.gpu_uuid, &slot.endpoint, memory)
            .await
        {
            SlotReserve::Reserved => {
                info!(
                    endpoint = %slot.endpoint,
                    daemon = %slot.daemon_address,
                    "Assigning pre-warmed worker"
                );
                endpoints.push(slot.endpoint.clone());
                remaining -= 1;
                spawn_backfill(state, slot.daemon_address.clone(), slot.gpu_uuid.clone());
                consumed.push(slot);
            }
            SlotReserve::Insufficient => {
                let _ = state.pool.push(slot).await;
            }
            SlotReserve::Gone => {
                debug!(endpoint = %slot.endpoint, "Dropping stale pool slot");
            }
        }
    }

    if remaining == 0 {
        return Ok(WorkerAssignReply {
            worker_address: endpoints,
        });
    }

    // Plan and reserve the remainder under the catalogue lock.
    let plan = match state.catalogue.plan_assignment(remaining, memory).await {
        Ok(plan) => plan,
        Err(e) => {
            restore_slots(state, consumed).await;
            return Err(e);
        }
    };

    // Fan the spawn RPCs out in parallel, one per assignment group.
    let mut set = JoinSet::new();
    for (idx, assignment) in plan.iter().cloned().enumerate() {
        let client = Arc::clone(&state.spawn_client);
        set.spawn(async move {
            let result = client
                .spawn_worker(
                    &assignment.daemon_address,
                    assignment.count,
                    &assignment.gpu_uuid,
                )
                .await;
            (idx, result)
        });
    }
    let mut results: Vec<Option<Result<Vec<String>, RpcError>>> =
        plan.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, result)) => results[idx] = Some(result),
            Err(e) => warn!(error = %e, "Spawn task panicked"),
        }
    }

    let mut spawned: Vec<(Assignment, Vec<String>)> = Vec::new();
    let mut failures: Vec<RpcError> = Vec::new();
    for (assignment, result) in plan.into_iter().zip(results.into_iter()) {
        match result {
            Some(Ok(worker_address)) => {
                state
                    .catalogue
                    .commit_workers(&assignment, &worker_address)
                    .await;
                spawned.push((assignment, worker_address));
            }
            Some(Err(e)) => {
                state
                    .catalogue
                    .rollback(std::slice::from_ref(&assignment))
                    .await;
                if e.code == ErrorCode::Unavailable {
                    // Lazy prune: the daemon comes back via re-registration.
                    state.catalogue.prune(&assignment.daemon_address).await;
                    state.pool.clear_daemon(&assignment.daemon_address).await;
                }
                warn!(
                    daemon = %assignment.daemon_address,
                    error = %e,
                    "Downstream spawn failed"
                );
                failures.push(e);
            }
            None => {
                state
                    .catalogue
                    .rollback(std::slice::from_ref(&assignment))
                    .await;
                failures.push(RpcError::internal("Spawn task lost"));
            }
        }
    }

    if !failures.is_empty() {
        // The guest sees a failure and retries; workers already spawned
        // stay alive. Park them so neither memory nor processes leak.
        let total_groups = failures.len() + spawned.len();
        restore_slots(state, consumed).await;
        for (assignment, worker_address) in spawned {
            park_stranded(state, &assignment, &worker_address).await;
        }
        let detail = failures
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(RpcError::unavailable(format!(
            "{} of {} spawn groups failed: {}",
            failures.len(),
            total_groups,
            detail
        )));
    }

    for (_, worker_address) in spawned {
        endpoints.extend(worker_address);
    }
    Ok(WorkerAssignReply {
        worker_address: endpoints,
    })
}

/// Pre-warm a freshly registered daemon: one spawn request for however many
/// slots its FIFO is short, on its emptiest GPU.
pub async fn warm_up(state: Arc<ManagerState>, daemon_address: String) {
    if !state.pool.enabled() {
        return;
    }
    let have = state.pool.len_for(&daemon_address).await;
    let want = state.pool.capacity().saturating_sub(have);
    if want == 0 {
        return;
    }
    let Some(uuid) = state.catalogue.best_gpu_for_prewarm(&daemon_address).await else {
        return;
    };

    match state
        .spawn_client
        .spawn_worker(&daemon_address, want as u32, &uuid)
        .await
    {
        Ok(worker_address) => {
            info!(
                daemon = %daemon_address,
                count = worker_address.len(),
                "Pre-warmed worker pool"
            );
            for endpoint in worker_address {
                adopt_pooled(&state, &daemon_address, &uuid, endpoint).await;
            }
        }
        Err(e) => {
            warn!(daemon = %daemon_address, error = %e, "Pool warm-up failed");
        }
    }
}

/// Asynchronously replace one consumed pool slot.
fn spawn_backfill(state: &Arc<ManagerState>, daemon_address: String, gpu_uuid: String) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        match state
            .spawn_client
            .spawn_worker(&daemon_address, 1, &gpu_uuid)
            .await
        {
            Ok(worker_address) => {
                for endpoint in worker_address {
                    adopt_pooled(&state, &daemon_address, &gpu_uuid, endpoint).await;
                }
            }
            Err(e) => {
                warn!(daemon = %daemon_address, error = %e, "Pool backfill failed");
            }
        }
    });
}

async fn adopt_pooled(state: &ManagerState, daemon_address: &str, gpu_uuid: &str, endpoint: String) {
    state
        .catalogue
        .commit_prewarmed(daemon_address, gpu_uuid, &endpoint)
        .await;
    let accepted = state
        .pool
        .push(PoolSlot {
            daemon_address: daemon_address.to_string(),
            gpu_uuid: gpu_uuid.to_string(),
            endpoint: endpoint.clone(),
        })
        .await;
    if !accepted {
        debug!(endpoint = %endpoint, "Pool refused slot, worker stays unpooled");
    }
}

/// Return consumed slots after a failed assignment: uncharge their
/// reservations and put them back in the FIFO.
async fn restore_slots(state: &Arc<ManagerState>, consumed: Vec<PoolSlot>) {
    for slot in consumed {
        state
            .catalogue
            .release_slot(&slot.daemon_address, &slot.endpoint)
            .await;
        let _ = state.pool.push(slot).await;
    }
}

/// A spawn group succeeded but the assignment as a whole failed. The
/// workers are alive (cancellation is advisory); uncharge them and park
/// their endpoints in the pool so a later assignment can pick them up.
/// Exit notifications reconcile them either way.
async fn park_stranded(state: &Arc<ManagerState>, assignment: &Assignment, endpoints: &[String]) {
    for endpoint in endpoints {
        if state.pool.enabled() {
            state
                .catalogue
                .release_slot(&assignment.daemon_address, endpoint)
                .await;
            let _ = state
                .pool
                .push(PoolSlot {
                    daemon_address: assignment.daemon_address.clone(),
                    gpu_uuid: assignment.gpu_uuid.clone(),
                    endpoint: endpoint.clone(),
                })
                .await;
        }
        // With the pool disabled the projection keeps its reservation
        // until the worker exits.
    }
}
