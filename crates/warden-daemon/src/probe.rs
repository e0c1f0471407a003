use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use nvml_wrapper::Nvml;
use tracing::debug;

use warden_core::gpu::GpuInfo;

/// Memory figures for one device, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMemory {
    pub total: u64,
    pub free: u64,
}

/// Driver-side GPU introspection. The daemon only ever asks one question:
/// how much memory does the device with this uuid have right now.
pub trait GpuProbe: Send + Sync {
    fn query(&self, uuid: &str) -> Result<GpuMemory>;
}

/// NVML-backed probe for real deployments.
pub struct NvmlProbe {
    nvml: Nvml,
}

impl NvmlProbe {
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().context("Failed to initialize NVML")?;
        Ok(Self { nvml })
    }
}

impl GpuProbe for NvmlProbe {
    fn query(&self, uuid: &str) -> Result<GpuMemory> {
        let device = self
            .nvml
            .device_by_uuid(uuid)
            .with_context(|| format!("Failed to get device by uuid {}", uuid))?;
        let mem = device
            .memory_info()
            .with_context(|| format!("Failed to get memory info for {}", uuid))?;
        debug!(uuid = %uuid, total = mem.total, free = mem.free, "Probed GPU");
        Ok(GpuMemory {
            total: mem.total,
            free: mem.free,
        })
    }
}

/// Fixed inventory probe for driverless hosts and tests: every queried uuid
/// must have been declared up front.
#[derive(Debug, Default)]
pub struct FixedProbe {
    devices: HashMap<String, GpuMemory>,
}

impl FixedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare every uuid in `uuids` with the same uniform memory size.
    pub fn uniform(uuids: &[String], bytes: u64) -> Self {
        let mut probe = Self::new();
        for uuid in uuids {
            probe.insert(uuid.clone(), bytes, bytes);
        }
        probe
    }

    pub fn insert(&mut self, uuid: impl Into<String>, total: u64, free: u64) -> &mut Self {
        self.devices.insert(uuid.into(), GpuMemory { total, free });
        self
    }
}

impl GpuProbe for FixedProbe {
    fn query(&self, uuid: &str) -> Result<GpuMemory> {
        match self.devices.get(uuid) {
            Some(mem) => Ok(*mem),
            None => bail!("Unknown GPU uuid {}", uuid),
        }
    }
}

/// Query the probe for every configured uuid. Any single failure fails the
/// whole enumeration; daemon startup treats that as fatal.
pub fn enumerate_gpus(probe: &dyn GpuProbe, uuids: &[String]) -> Result<Vec<GpuInfo>> {
    uuids
        .iter()
        .map(|uuid| {
            let mem = probe
                .query(uuid)
                .with_context(|| format!("GPU enumeration failed for {}", uuid))?;
            Ok(GpuInfo::new(uuid.clone(), mem.total, mem.free))
        })
        .collect()
}
