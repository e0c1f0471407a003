use warden_core::protocol::RpcError;

/// One GPU of one daemon, as seen in a catalogue snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuCandidate {
    pub daemon_address: String,
    pub uuid: String,
    pub free_memory: u64,
    pub worker_count: usize,
}

/// A placement decision: spawn `count` workers on one daemon GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub daemon_address: String,
    pub gpu_uuid: String,
    pub count: u32,
    pub memory_per_worker: u64,
}

impl Assignment {
    pub fn reserved_total(&self) -> u64 {
        self.memory_per_worker * self.count as u64
    }
}

/// Place `worker_count` workers of `memory_per_worker` bytes each onto the
/// candidate GPUs.
///
/// Best-fit: each worker goes to the GPU with the smallest sufficient free
/// memory, ties broken by lowest current worker count, then lexicographic
/// `(daemon_address, uuid)`. Free memory and worker counts are tracked
/// locally while placing, so a multi-worker request spreads once a GPU
/// fills up. Pure function of the snapshot; given the same snapshot the
/// result is identical.
pub fn place(
    candidates: &[GpuCandidate],
    worker_count: u32,
    memory_per_worker: u64,
) -> Result<Vec<Assignment>, RpcError> {
    if worker_count == 0 {
        return Err(RpcError::invalid_argument("Zero worker count"));
    }

    let mut working: Vec<GpuCandidate> = candidates.to_vec();
    working.sort_by(|a, b| {
        (&a.daemon_address, &a.uuid).cmp(&(&b.daemon_address, &b.uuid))
    });

    let mut counts: Vec<u32> = vec![0; working.len()];
    let mut order: Vec<usize> = Vec::new();

    for placed in 0..worker_count {
        let best = working
            .iter()
            .enumerate()
            .filter(|(_, c)| c.free_memory >= memory_per_worker)
            .min_by(|(ia, a), (ib, b)| {
                a.free_memory
                    .cmp(&b.free_memory)
                    .then(a.worker_count.cmp(&b.worker_count))
                    .then(ia.cmp(ib))
            })
            .map(|(i, _)| i);

        let Some(i) = best else {
            return Err(RpcError::resource_exhausted(format!(
                "No GPU can satisfy {} bytes for worker {} of {}",
                memory_per_worker,
                placed + 1,
                worker_count
            )));
        };

        if counts[i] == 0 {
            order.push(i);
        }
        counts[i] += 1;
        working[i].free_memory -= memory_per_worker;
        working[i].worker_count += 1;
    }

    Ok(order
        .into_iter()
        .map(|i| Assignment {
            daemon_address: working[i].daemon_address.clone(),
            gpu_uuid: working[i].uuid.clone(),
            count: counts[i],
            memory_per_worker,
        })
        .collect())
}
