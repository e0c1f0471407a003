use serde::{Deserialize, Serialize};

/// One physical GPU as seen by a daemon: driver uuid plus the memory figures
/// used for admission control. `free_memory` never exceeds `total_memory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub uuid: String,
    pub total_memory: u64,
    pub free_memory: u64,
}

impl GpuInfo {
    pub fn new(uuid: impl Into<String>, total_memory: u64, free_memory: u64) -> Self {
        Self {
            uuid: uuid.into(),
            total_memory,
            free_memory: free_memory.min(total_memory),
        }
    }
}
