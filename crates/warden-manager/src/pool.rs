use std::collections::{BTreeMap, VecDeque};

use tokio::sync::Mutex;
use tracing::debug;

/// A pre-spawned worker waiting to be handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSlot {
    pub daemon_address: String,
    pub gpu_uuid: String,
    pub endpoint: String,
}

/// Bounded FIFOs of pre-warmed workers, one per daemon.
///
/// Dequeuing a slot consumes it; each slot is issued at most once. Capacity
/// zero disables the pool entirely.
pub struct WorkerPool {
    capacity: usize,
    slots: Mutex<BTreeMap<String, VecDeque<PoolSlot>>>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the head slot from the first non-empty daemon FIFO, in daemon
    /// address order.
    pub async fn pop(&self) -> Option<PoolSlot> {
        let mut slots = self.slots.lock().await;
        for queue in slots.values_mut() {
            if let Some(slot) = queue.pop_front() {
                return Some(slot);
            }
        }
        None
    }

    /// Enqueue a slot; refused (false) when the pool is disabled or that
    /// daemon's FIFO is at capacity.
    pub async fn push(&self, slot: PoolSlot) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let mut slots = self.slots.lock().await;
        let queue = slots.entry(slot.daemon_address.clone()).or_default();
        if queue.len() >= self.capacity {
            debug!(
                daemon = %slot.daemon_address,
                endpoint = %slot.endpoint,
                "Pool full, refusing slot"
            );
            return false;
        }
        queue.push_back(slot);
        true
    }

    /// Drop the slot holding `endpoint`, if pooled. Used when a pre-warmed
    /// worker exits before it was ever handed out.
    pub async fn discard_endpoint(&self, endpoint: &str) -> bool {
        let mut slots = self.slots.lock().await;
        for queue in slots.values_mut() {
            if let Some(pos) = queue.iter().position(|s| s.endpoint == endpoint) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Drop every slot belonging to a daemon (re-registration, prune).
    pub async fn clear_daemon(&self, daemon_address: &str) -> usize {
        let mut slots = self.slots.lock().await;
        slots
            .remove(daemon_address)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub async fn len_for(&self, daemon_address: &str) -> usize {
        let slots = self.slots.lock().await;
        slots.get(daemon_address).map(|q| q.len()).unwrap_or(0)
    }

    pub async fn total_len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.values().map(|q| q.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(daemon: &str, endpoint: &str) -> PoolSlot {
        PoolSlot {
            daemon_address: daemon.to_string(),
            gpu_uuid: "GPU-a".to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order_within_daemon() {
        let pool = WorkerPool::new(3);
        assert!(pool.push(slot("d1", "d1:4000")).await);
        assert!(pool.push(slot("d1", "d1:4001")).await);
        assert_eq!(pool.pop().await.unwrap().endpoint, "d1:4000");
        assert_eq!(pool.pop().await.unwrap().endpoint, "d1:4001");
        assert!(pool.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_bound_per_daemon() {
        let pool = WorkerPool::new(2);
        assert!(pool.push(slot("d1", "d1:4000")).await);
        assert!(pool.push(slot("d1", "d1:4001")).await);
        assert!(!pool.push(slot("d1", "d1:4002")).await);
        // A different daemon has its own FIFO.
        assert!(pool.push(slot("d2", "d2:4000")).await);
    }

    #[tokio::test]
    async fn test_disabled_pool_refuses_slots() {
        let pool = WorkerPool::disabled();
        assert!(!pool.enabled());
        assert!(!pool.push(slot("d1", "d1:4000")).await);
        assert!(pool.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_iterates_daemons_in_order() {
        let pool = WorkerPool::new(3);
        pool.push(slot("d2", "d2:4000")).await;
        pool.push(slot("d1", "d1:4000")).await;
        assert_eq!(pool.pop().await.unwrap().daemon_address, "d1");
        assert_eq!(pool.pop().await.unwrap().daemon_address, "d2");
    }

    #[tokio::test]
    async fn test_discard_endpoint() {
        let pool = WorkerPool::new(3);
        pool.push(slot("d1", "d1:4000")).await;
        pool.push(slot("d1", "d1:4001")).await;
        assert!(pool.discard_endpoint("d1:4000").await);
        assert!(!pool.discard_endpoint("d1:4000").await);
        assert_eq!(pool.total_len().await, 1);
        assert_eq!(pool.pop().await.unwrap().endpoint, "d1:4001");
    }

    #[tokio::test]
    async fn test_clear_daemon() {
        let pool = WorkerPool::new(3);
        pool.push(slot("d1", "d1:4000")).await;
        pool.push(slot("d1", "d1:4001")).await;
        pool.push(slot("d2", "d2:4000")).await;
        assert_eq!(pool.clear_daemon("d1").await, 2);
        assert_eq!(pool.total_len().await, 1);
        assert_eq!(pool.len_for("d1").await, 0);
    }
}
