use std::sync::Mutex;

use anyhow::{Result, bail};
use tracing::warn;

use crate::gpu::GpuInfo;

/// Outcome of a reservation attempt. Running out of memory is a normal
/// signalled result, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    Insufficient,
}

/// Per-GPU free-memory accounting, the basis of admission control.
///
/// Backed by parallel arrays indexed by a provisioner-local `gpu_id`. The
/// free-memory vector is the only mutable state and is guarded by a single
/// mutex; the critical section is a compare and an addition.
///
/// Out-of-range `gpu_id` values are a programmer error and panic.
#[derive(Debug)]
pub struct GpuProvisioner {
    index: Vec<u32>,
    uuid: Vec<String>,
    total: Vec<u64>,
    free: Mutex<Vec<u64>>,
}

impl GpuProvisioner {
    /// Build from pre-split uuid and capacity vectors. The host device index
    /// is the identity mapping.
    pub fn new(uuids: Vec<String>, capacities: Vec<u64>) -> Result<Self> {
        if uuids.len() != capacities.len() {
            bail!(
                "GPU uuid/capacity length mismatch: {} uuids, {} capacities",
                uuids.len(),
                capacities.len()
            );
        }
        if uuids.iter().any(|u| u.is_empty()) {
            bail!("GPU uuid list contains an empty uuid");
        }
        let index = (0..uuids.len() as u32).collect();
        Ok(Self {
            index,
            uuid: uuids,
            free: Mutex::new(capacities.clone()),
            total: capacities,
        })
    }

    /// Build from delimited strings: a comma-separated uuid list and a
    /// comma-separated list of per-GPU byte capacities, equal length.
    pub fn from_lists(uuid_list: &str, mem_list: &str) -> Result<Self> {
        let uuids: Vec<String> = uuid_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let capacities = mem_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("Invalid GPU capacity '{}': {}", s, e))
            })
            .collect::<Result<Vec<u64>>>()?;
        Self::new(uuids, capacities)
    }

    /// Build a provisioner for a subset of the host's GPUs. `host_uuids` is
    /// the full host-order uuid list; each provisioned uuid is mapped to its
    /// position there so `index()` can recover the host device index.
    pub fn with_host_index(
        host_uuids: &[String],
        uuids: Vec<String>,
        capacities: Vec<u64>,
    ) -> Result<Self> {
        let mut provisioner = Self::new(uuids, capacities)?;
        provisioner.index = provisioner
            .uuid
            .iter()
            .map(|u| {
                host_uuids
                    .iter()
                    .position(|h| h == u)
                    .map(|p| p as u32)
                    .ok_or_else(|| anyhow::anyhow!("GPU uuid '{}' not present on host", u))
            })
            .collect::<Result<Vec<u32>>>()?;
        Ok(provisioner)
    }

    pub fn gpu_count(&self) -> usize {
        self.uuid.len()
    }

    pub fn uuid(&self, gpu_id: usize) -> &str {
        &self.uuid[gpu_id]
    }

    /// Map a provisioner-local id to the underlying host device index.
    pub fn index(&self, gpu_id: usize) -> u32 {
        self.index[gpu_id]
    }

    /// Find the local id for a uuid, if this provisioner holds it.
    pub fn find(&self, uuid: &str) -> Option<usize> {
        self.uuid.iter().position(|u| u == uuid)
    }

    pub fn total_memory(&self, gpu_id: usize) -> u64 {
        self.total[gpu_id]
    }

    pub fn free_memory(&self, gpu_id: usize) -> u64 {
        self.free.lock().expect("gpu accounting mutex poisoned")[gpu_id]
    }

    /// Atomically decrement free memory by `size` iff it covers the request.
    pub fn reserve(&self, gpu_id: usize, size: u64) -> Reservation {
        let mut free = self.free.lock().expect("gpu accounting mutex poisoned");
        if free[gpu_id] >= size {
            free[gpu_id] -= size;
            Reservation::Reserved
        } else {
            Reservation::Insufficient
        }
    }

    /// Atomically increment free memory by `size`, saturating at the GPU's
    /// total. Over-release indicates a double release upstream; it is logged
    /// and clamped, not fatal.
    pub fn release(&self, gpu_id: usize, size: u64) {
        let mut free = self.free.lock().expect("gpu accounting mutex poisoned");
        let next = free[gpu_id].saturating_add(size);
        if next > self.total[gpu_id] {
            warn!(
                gpu_id,
                uuid = %self.uuid[gpu_id],
                release = size,
                total = self.total[gpu_id],
                "Over-release of GPU memory, clamping to total"
            );
            free[gpu_id] = self.total[gpu_id];
        } else {
            free[gpu_id] = next;
        }
    }

    /// Snapshot all GPUs with their current free memory.
    pub fn snapshot(&self) -> Vec<GpuInfo> {
        let free = self.free.lock().expect("gpu accounting mutex poisoned");
        self.uuid
            .iter()
            .zip(self.total.iter())
            .zip(free.iter())
            .map(|((uuid, total), free)| GpuInfo::new(uuid.clone(), *total, *free))
            .collect()
    }
}
