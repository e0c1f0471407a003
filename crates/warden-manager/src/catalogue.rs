use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use warden_core::protocol::{DaemonRegisterRequest, RpcError};
use warden_core::provision::{GpuProvisioner, Reservation};

use crate::placement::{Assignment, GpuCandidate};

/// The manager's projection of one worker. The authoritative record lives on
/// the owning daemon; this copy exists for placement and accounting and is
/// reconciled through exit notifications.
#[derive(Debug, Clone)]
pub struct WorkerProjection {
    pub gpu_uuid: String,
    pub reserved_memory: u64,
}

/// One registered daemon. GPU accounting is a `GpuProvisioner` seeded from
/// the registration snapshot, so the registered free memory acts as the
/// release ceiling (the manager never learns true device totals).
pub struct DaemonRecord {
    pub address: String,
    pub gpus: GpuProvisioner,
    pub workers: HashMap<String, WorkerProjection>,
    pub last_registered_at: DateTime<Utc>,
}

/// Outcome of charging a pre-warm pool slot with a real reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotReserve {
    Reserved,
    /// The slot's GPU cannot cover the request; the slot is still usable.
    Insufficient,
    /// The daemon or worker no longer exists; drop the slot.
    Gone,
}

/// The daemon catalogue: the manager's entire view of the fleet.
///
/// One reader-writer lock guards the record map. Assignment planning holds
/// the write lock only for the snapshot-and-reserve step; downstream RPCs
/// happen outside it and roll back through `rollback` on failure.
#[derive(Default)]
pub struct Catalogue {
    daemons: RwLock<BTreeMap<String, DaemonRecord>>,
}

impl Catalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a daemon, atomically replacing any prior record for the same
    /// address (re-registration after a daemon restart).
    pub async fn register(&self, req: &DaemonRegisterRequest) -> Result<(), RpcError> {
        if req.self_address.is_empty() {
            return Err(RpcError::invalid_argument("Empty daemon address"));
        }
        if req.free_memory.len() != req.uuid.len() {
            return Err(RpcError::invalid_argument(
                "Mismatched uuid/free_memory vector lengths",
            ));
        }
        if req.uuid.is_empty() {
            return Err(RpcError::invalid_argument("Daemon registered no GPUs"));
        }

        let gpus = GpuProvisioner::new(req.uuid.clone(), req.free_memory.clone())
            .map_err(|e| RpcError::invalid_argument(e.to_string()))?;

        let record = DaemonRecord {
            address: req.self_address.clone(),
            gpus,
            workers: HashMap::new(),
            last_registered_at: Utc::now(),
        };

        let mut daemons = self.daemons.write().await;
        let replaced = daemons.insert(req.self_address.clone(), record).is_some();
        info!(
            daemon = %req.self_address,
            gpu_count = req.uuid.len(),
            replaced,
            "Daemon registered"
        );
        Ok(())
    }

    /// Snapshot the catalogue, run placement, and apply the reservations,
    /// all under one write-lock acquisition so concurrent assignments
    /// serialize on the reserve step.
    pub async fn plan_assignment(
        &self,
        worker_count: u32,
        memory_per_worker: u64,
    ) -> Result<Vec<Assignment>, RpcError> {
        let mut daemons = self.daemons.write().await;

        let mut candidates = Vec::new();
        for (addr, record) in daemons.iter() {
            let mut per_gpu: HashMap<&str, usize> = HashMap::new();
            for proj in record.workers.values() {
                *per_gpu.entry(proj.gpu_uuid.as_str()).or_default() += 1;
            }
            for gpu in record.gpus.snapshot() {
                let worker_count = per_gpu.get(gpu.uuid.as_str()).copied().unwrap_or(0);
                candidates.push(GpuCandidate {
                    daemon_address: addr.clone(),
                    uuid: gpu.uuid,
                    free_memory: gpu.free_memory,
                    worker_count,
                });
            }
        }

        let plan = crate::placement::place(&candidates, worker_count, memory_per_worker)?;

        let mut applied: Vec<&Assignment> = Vec::new();
        for assignment in &plan {
            let outcome = reserve_in(&mut daemons, assignment);
            if outcome != Reservation::Reserved {
                // The snapshot was taken under this same guard, so this
                // indicates corrupted accounting. Undo and refuse.
                for done in applied {
                    release_in(&mut daemons, done);
                }
                return Err(RpcError::internal(format!(
                    "Reservation failed for {} on {}",
                    assignment.gpu_uuid, assignment.daemon_address
                )));
            }
            applied.push(assignment);
        }

        Ok(plan)
    }

    /// Roll back the reservations of assignments whose spawns never
    /// happened.
    pub async fn rollback(&self, assignments: &[Assignment]) {
        let mut daemons = self.daemons.write().await;
        for assignment in assignments {
            release_in(&mut daemons, assignment);
        }
    }

    /// Record projections for workers spawned under an assignment.
    pub async fn commit_workers(&self, assignment: &Assignment, endpoints: &[String]) {
        let mut daemons = self.daemons.write().await;
        let Some(record) = daemons.get_mut(&assignment.daemon_address) else {
            warn!(
                daemon = %assignment.daemon_address,
                "Daemon vanished before commit, dropping projections"
            );
            return;
        };
        for endpoint in endpoints {
            record.workers.insert(
                endpoint.clone(),
                WorkerProjection {
                    gpu_uuid: assignment.gpu_uuid.clone(),
                    reserved_memory: assignment.memory_per_worker,
                },
            );
        }
    }

    /// Record a pre-warmed worker: projected but carrying no reservation
    /// until an assignment consumes its slot.
    pub async fn commit_prewarmed(&self, daemon_address: &str, gpu_uuid: &str, endpoint: &str) {
        let mut daemons = self.daemons.write().await;
        let Some(record) = daemons.get_mut(daemon_address) else {
            return;
        };
        record.workers.insert(
            endpoint.to_string(),
            WorkerProjection {
                gpu_uuid: gpu_uuid.to_string(),
                reserved_memory: 0,
            },
        );
    }

    /// Charge a consumed pool slot with the requested reservation.
    pub async fn reserve_for_slot(
        &self,
        daemon_address: &str,
        gpu_uuid: &str,
        endpoint: &str,
        memory: u64,
    ) -> SlotReserve {
        let mut daemons = self.daemons.write().await;
        let Some(record) = daemons.get_mut(daemon_address) else {
            return SlotReserve::Gone;
        };
        if !record.workers.contains_key(endpoint) {
            // The pre-warmed worker already exited.
            return SlotReserve::Gone;
        }
        let Some(gpu_id) = record.gpus.find(gpu_uuid) else {
            return SlotReserve::Gone;
        };
        if record.gpus.reserve(gpu_id, memory) != Reservation::Reserved {
            return SlotReserve::Insufficient;
        }
        if let Some(proj) = record.workers.get_mut(endpoint) {
            proj.reserved_memory = memory;
        }
        SlotReserve::Reserved
    }

    /// Undo `reserve_for_slot`: the assignment failed and the worker goes
    /// back to being an uncharged pre-warmed slot.
    pub async fn release_slot(&self, daemon_address: &str, endpoint: &str) {
        let mut daemons = self.daemons.write().await;
        let Some(record) = daemons.get_mut(daemon_address) else {
            return;
        };
        let Some(proj) = record.workers.get_mut(endpoint) else {
            return;
        };
        let released = std::mem::take(&mut proj.reserved_memory);
        if released > 0
            && let Some(gpu_id) = record.gpus.find(&proj.gpu_uuid)
        {
            record.gpus.release(gpu_id, released);
        }
    }

    /// Apply a worker-exit notification: release the worker's reservation
    /// and drop its projection. Idempotent: a retried notification finds
    /// no projection and changes nothing.
    pub async fn apply_exit(&self, endpoint: &str, uuids: &[String]) -> bool {
        let mut daemons = self.daemons.write().await;
        for record in daemons.values_mut() {
            let Some(proj) = record.workers.remove(endpoint) else {
                continue;
            };
            if let Some(gpu_id) = record.gpus.find(&proj.gpu_uuid) {
                record.gpus.release(gpu_id, proj.reserved_memory);
            }
            if let Some(reported) = uuids.first()
                && *reported != proj.gpu_uuid
            {
                warn!(
                    endpoint,
                    reported = %reported,
                    recorded = %proj.gpu_uuid,
                    "Exit notification uuid mismatch"
                );
            }
            info!(
                endpoint,
                uuid = %proj.gpu_uuid,
                released = proj.reserved_memory,
                "Worker exit applied"
            );
            return true;
        }
        debug!(endpoint, "Exit notification for unknown worker");
        false
    }

    /// Evict a daemon (lazy prune after a transport failure). Its worker
    /// projections and accounting go with it; re-registration restores it.
    pub async fn prune(&self, daemon_address: &str) -> bool {
        let mut daemons = self.daemons.write().await;
        let removed = daemons.remove(daemon_address).is_some();
        if removed {
            warn!(daemon = %daemon_address, "Daemon pruned from catalogue");
        }
        removed
    }

    /// The GPU with the most free memory on a daemon, for pre-warm spawns.
    pub async fn best_gpu_for_prewarm(&self, daemon_address: &str) -> Option<String> {
        let daemons = self.daemons.read().await;
        let record = daemons.get(daemon_address)?;
        record
            .gpus
            .snapshot()
            .into_iter()
            .max_by_key(|g| g.free_memory)
            .map(|g| g.uuid)
    }

    pub async fn daemon_count(&self) -> usize {
        self.daemons.read().await.len()
    }

    pub async fn free_memory(&self, daemon_address: &str, uuid: &str) -> Option<u64> {
        let daemons = self.daemons.read().await;
        let record = daemons.get(daemon_address)?;
        let gpu_id = record.gpus.find(uuid)?;
        Some(record.gpus.free_memory(gpu_id))
    }

    pub async fn worker_count(&self, daemon_address: &str) -> Option<usize> {
        let daemons = self.daemons.read().await;
        Some(daemons.get(daemon_address)?.workers.len())
    }
}

fn reserve_in(
    daemons: &mut BTreeMap<String, DaemonRecord>,
    assignment: &Assignment,
) -> Reservation {
    let Some(record) = daemons.get_mut(&assignment.daemon_address) else {
        return Reservation::Insufficient;
    };
    let Some(gpu_id) = record.gpus.find(&assignment.gpu_uuid) else {
        return Reservation::Insufficient;
    };
    record.gpus.reserve(gpu_id, assignment.reserved_total())
}

fn release_in(daemons: &mut BTreeMap<String, DaemonRecord>, assignment: &Assignment) {
    let Some(record) = daemons.get_mut(&assignment.daemon_address) else {
        return;
    };
    let Some(gpu_id) = record.gpus.find(&assignment.gpu_uuid) else {
        return;
    };
    record.gpus.release(gpu_id, assignment.reserved_total());
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    fn register_req(address: &str, gpus: &[(&str, u64)]) -> DaemonRegisterRequest {
        DaemonRegisterRequest {
            self_address: address.to_string(),
            free_memory: gpus.iter().map(|(_, m)| *m).collect(),
            uuid: gpus.iter().map(|(u, _)| u.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_register_and_replace() {
        let catalogue = Catalogue::new();
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 8 * GIB)]))
            .await
            .unwrap();
        assert_eq!(catalogue.daemon_count().await, 1);
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(8 * GIB)
        );

        // Re-registration overwrites, dropping old accounting.
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 4 * GIB)]))
            .await
            .unwrap();
        assert_eq!(catalogue.daemon_count().await, 1);
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(4 * GIB)
        );
    }

    #[tokio::test]
    async fn test_register_rejects_mismatched_vectors() {
        let catalogue = Catalogue::new();
        let req = DaemonRegisterRequest {
            self_address: "d1:3335".to_string(),
            free_memory: vec![8 * GIB],
            uuid: vec!["GPU-a".to_string(), "GPU-b".to_string()],
        };
        let err = catalogue.register(&req).await.unwrap_err();
        assert_eq!(err.code, warden_core::protocol::ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_register_rejects_empty_gpu_set() {
        let catalogue = Catalogue::new();
        let err = catalogue
            .register(&register_req("d1:3335", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.code, warden_core::protocol::ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_plan_reserves_memory() {
        let catalogue = Catalogue::new();
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 8 * GIB)]))
            .await
            .unwrap();
        let plan = catalogue.plan_assignment(1, GIB).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(7 * GIB)
        );
    }

    #[tokio::test]
    async fn test_plan_exhaustion_leaves_catalogue_unchanged() {
        let catalogue = Catalogue::new();
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 2 * GIB)]))
            .await
            .unwrap();
        let err = catalogue.plan_assignment(1, 4 * GIB).await.unwrap_err();
        assert_eq!(
            err.code,
            warden_core::protocol::ErrorCode::ResourceExhausted
        );
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(2 * GIB)
        );
    }

    #[tokio::test]
    async fn test_rollback_restores_free_memory() {
        let catalogue = Catalogue::new();
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 8 * GIB)]))
            .await
            .unwrap();
        let plan = catalogue.plan_assignment(3, GIB).await.unwrap();
        catalogue.rollback(&plan).await;
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(8 * GIB)
        );
    }

    #[tokio::test]
    async fn test_exit_releases_and_is_idempotent() {
        let catalogue = Catalogue::new();
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 8 * GIB)]))
            .await
            .unwrap();
        let plan = catalogue.plan_assignment(1, GIB).await.unwrap();
        catalogue
            .commit_workers(&plan[0], &["0.0.0.0:4000".to_string()])
            .await;
        assert_eq!(catalogue.worker_count("d1:3335").await, Some(1));

        let uuids = vec!["GPU-a".to_string()];
        assert!(catalogue.apply_exit("0.0.0.0:4000", &uuids).await);
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(8 * GIB)
        );
        assert_eq!(catalogue.worker_count("d1:3335").await, Some(0));

        // Retried notification: at most one EXITED transition is observed.
        assert!(!catalogue.apply_exit("0.0.0.0:4000", &uuids).await);
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(8 * GIB)
        );
    }

    #[tokio::test]
    async fn test_slot_reserve_and_release() {
        let catalogue = Catalogue::new();
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 8 * GIB)]))
            .await
            .unwrap();
        catalogue
            .commit_prewarmed("d1:3335", "GPU-a", "0.0.0.0:4000")
            .await;

        let outcome = catalogue
            .reserve_for_slot("d1:3335", "GPU-a", "0.0.0.0:4000", GIB)
            .await;
        assert_eq!(outcome, SlotReserve::Reserved);
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(7 * GIB)
        );

        catalogue.release_slot("d1:3335", "0.0.0.0:4000").await;
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(8 * GIB)
        );
    }

    #[tokio::test]
    async fn test_slot_reserve_insufficient() {
        let catalogue = Catalogue::new();
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 2 * GIB)]))
            .await
            .unwrap();
        catalogue
            .commit_prewarmed("d1:3335", "GPU-a", "0.0.0.0:4000")
            .await;
        let outcome = catalogue
            .reserve_for_slot("d1:3335", "GPU-a", "0.0.0.0:4000", 4 * GIB)
            .await;
        assert_eq!(outcome, SlotReserve::Insufficient);
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(2 * GIB)
        );
    }

    #[tokio::test]
    async fn test_slot_reserve_gone_after_exit() {
        let catalogue = Catalogue::new();
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 8 * GIB)]))
            .await
            .unwrap();
        catalogue
            .commit_prewarmed("d1:3335", "GPU-a", "0.0.0.0:4000")
            .await;
        catalogue
            .apply_exit("0.0.0.0:4000", &["GPU-a".to_string()])
            .await;
        let outcome = catalogue
            .reserve_for_slot("d1:3335", "GPU-a", "0.0.0.0:4000", GIB)
            .await;
        assert_eq!(outcome, SlotReserve::Gone);
    }

    #[tokio::test]
    async fn test_prune() {
        let catalogue = Catalogue::new();
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 8 * GIB)]))
            .await
            .unwrap();
        assert!(catalogue.prune("d1:3335").await);
        assert!(!catalogue.prune("d1:3335").await);
        assert_eq!(catalogue.daemon_count().await, 0);
    }

    #[tokio::test]
    async fn test_best_gpu_for_prewarm_picks_most_free() {
        let catalogue = Catalogue::new();
        catalogue
            .register(&register_req(
                "d1:3335",
                &[("GPU-a", 4 * GIB), ("GPU-b", 8 * GIB)],
            ))
            .await
            .unwrap();
        assert_eq!(
            catalogue.best_gpu_for_prewarm("d1:3335").await,
            Some("GPU-b".to_string())
        );
    }

    #[tokio::test]
    async fn test_concurrent_reserve_exactly_one_winner() {
        use std::sync::Arc;

        let catalogue = Arc::new(Catalogue::new());
        catalogue
            .register(&register_req("d1:3335", &[("GPU-a", 4 * GIB)]))
            .await
            .unwrap();

        let a = {
            let c = Arc::clone(&catalogue);
            tokio::spawn(async move { c.plan_assignment(1, 3 * GIB).await })
        };
        let b = {
            let c = Arc::clone(&catalogue);
            tokio::spawn(async move { c.plan_assignment(1, 3 * GIB).await })
        };
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        assert!(ra.is_ok() ^ rb.is_ok(), "exactly one assignment must win");
        assert_eq!(
            catalogue.free_memory("d1:3335", "GPU-a").await,
            Some(GIB)
        );
    }
}
