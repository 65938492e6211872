//! GPU memory and compute-slot bookkeeping.
//!
//! Every device's accounting is mutated only through
//! [`GpuResourceManager::allocate_gpu`] and [`GpuResourceManager::release_gpu`]
//! under a single table lock, so an allocation can never double-book memory.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use error_stack::Report;
use serde::{Deserialize, Serialize};

use crate::{GovernorError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuDeviceConfig {
    pub device_id: u32,
    pub name: String,
    pub total_memory_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuConfig {
    /// Live allocations allowed on one device at a time.
    pub max_concurrent_per_device: usize,
    /// Device inventory, in discovery order.
    pub devices: Vec<GpuDeviceConfig>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_device: 4,
            devices: vec![GpuDeviceConfig {
                device_id: 0,
                name: "Virtual GPU".to_string(),
                total_memory_mb: 8192,
            }],
        }
    }
}

/// Copy of a device's accounting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    pub device_id: u32,
    pub name: String,
    pub total_memory_mb: u64,
    pub free_memory_mb: u64,
    pub used_memory_mb: u64,
    pub utilization_percent: f64,
    pub in_use: bool,
    pub allocations: usize,
    /// Time since the last successful allocation on this device.
    pub idle_ms: Option<u64>,
}

/// A live reservation on one device.
///
/// Deliberately not `Clone`: the holder gives it back exactly once through
/// [`GpuResourceManager::release_gpu`].
#[derive(Debug, PartialEq, Eq)]
pub struct GpuAllocation {
    pub device_id: u32,
    pub memory_mb: u64,
    pub resource_id: String,
    pub allocated_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpuStats {
    pub total_gpus: usize,
    /// Devices without any live allocation.
    pub available_gpus: usize,
    pub total_allocations: usize,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub failed_allocations: u64,
}

#[derive(Debug)]
struct Device {
    device_id: u32,
    name: String,
    total_memory_mb: u64,
    free_memory_mb: u64,
    used_memory_mb: u64,
    utilization_percent: f64,
    allocations: usize,
    last_used: Option<Instant>,
}

impl Device {
    fn new(cfg: &GpuDeviceConfig) -> Self {
        Self {
            device_id: cfg.device_id,
            name: cfg.name.clone(),
            total_memory_mb: cfg.total_memory_mb,
            free_memory_mb: cfg.total_memory_mb,
            used_memory_mb: 0,
            utilization_percent: 0.0,
            allocations: 0,
            last_used: None,
        }
    }

    fn refresh_utilization(&mut self) {
        if self.total_memory_mb > 0 {
            self.utilization_percent = self.used_memory_mb as f64 / self.total_memory_mb as f64 * 100.0;
        }
    }

    /// Lower is better: idle devices with headroom win.
    fn score(&self) -> f64 {
        self.utilization_percent - self.free_memory_mb as f64 / self.total_memory_mb as f64 * 100.0
    }

    fn info(&self) -> GpuInfo {
        GpuInfo {
            device_id: self.device_id,
            name: self.name.clone(),
            total_memory_mb: self.total_memory_mb,
            free_memory_mb: self.free_memory_mb,
            used_memory_mb: self.used_memory_mb,
            utilization_percent: self.utilization_percent,
            in_use: self.allocations > 0,
            allocations: self.allocations,
            idle_ms: self.last_used.map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

#[derive(Debug, Default)]
struct GpuTable {
    devices: Vec<Device>,
    /// resource id -> (device id, memory)
    allocations: HashMap<String, (u32, u64)>,
    next_id: u64,
    failed_allocations: u64,
}

impl GpuTable {
    fn position(&self, device_id: u32) -> Option<usize> {
        self.devices.iter().position(|d| d.device_id == device_id)
    }

    /// Lowest-scoring device with free memory; first wins ties. Falls back to
    /// the first device when none has free memory.
    fn best_position(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, device) in self.devices.iter().enumerate() {
            if device.free_memory_mb == 0 {
                continue;
            }
            let score = device.score();
            match best {
                Some((_, best_score)) if best_score <= score => {}
                _ => best = Some((idx, score)),
            }
        }
        match best {
            Some((idx, _)) => Some(idx),
            None if self.devices.is_empty() => None,
            None => Some(0),
        }
    }
}

pub struct GpuResourceManager {
    max_concurrent_per_device: usize,
    table: Mutex<GpuTable>,
}

impl GpuResourceManager {
    /// Build a manager over the configured inventory.
    pub fn new(cfg: &GpuConfig) -> Result<Self, GovernorError> {
        if cfg.max_concurrent_per_device == 0 {
            return Err(Report::new(GovernorError::invalid_config(
                "gpu.maxConcurrentPerDevice must be positive",
            )));
        }
        let manager = Self {
            max_concurrent_per_device: cfg.max_concurrent_per_device,
            table: Mutex::new(GpuTable::default()),
        };
        for device in &cfg.devices {
            manager.register_device(device)?;
        }
        tracing::info!(
            devices = cfg.devices.len(),
            max_concurrent_per_device = cfg.max_concurrent_per_device,
            "gpu resource manager initialized"
        );
        Ok(manager)
    }

    fn lock(&self) -> MutexGuard<'_, GpuTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a device to the inventory.
    pub fn register_device(&self, cfg: &GpuDeviceConfig) -> Result<(), GovernorError> {
        if cfg.total_memory_mb == 0 {
            return Err(Report::new(GovernorError::invalid_argument(format!(
                "gpu {} has no memory",
                cfg.device_id
            ))));
        }
        let mut table = self.lock();
        if table.position(cfg.device_id).is_some() {
            return Err(Report::new(GovernorError::invalid_argument(format!(
                "gpu {} registered twice",
                cfg.device_id
            ))));
        }
        table.devices.push(Device::new(cfg));
        tracing::debug!(device_id = cfg.device_id, name = %cfg.name, total_memory_mb = cfg.total_memory_mb, "gpu registered");
        Ok(())
    }

    /// Reserve `memory_mb` on `preferred_device`, or on the best device when
    /// no usable preference is given.
    ///
    /// Returns `None` when the chosen device lacks memory or is already at its
    /// concurrency limit.
    pub fn allocate_gpu(&self, memory_mb: u64, preferred_device: Option<u32>) -> Option<GpuAllocation> {
        debug_assert!(memory_mb > 0, "allocation size must be positive");
        if memory_mb == 0 {
            tracing::error!("rejected zero-sized gpu allocation");
            return None;
        }

        let mut table = self.lock();
        let idx = preferred_device
            .and_then(|id| table.position(id))
            .or_else(|| table.best_position());
        let Some(idx) = idx else {
            table.failed_allocations += 1;
            tracing::warn!("no gpu registered");
            return None;
        };

        let device = &table.devices[idx];
        let device_id = device.device_id;
        if device.free_memory_mb < memory_mb {
            tracing::debug!(device_id, memory_mb, free_memory_mb = device.free_memory_mb, "gpu memory exhausted");
            table.failed_allocations += 1;
            return None;
        }
        if device.allocations >= self.max_concurrent_per_device {
            tracing::debug!(device_id, allocations = device.allocations, "gpu concurrency limit reached");
            table.failed_allocations += 1;
            return None;
        }

        let now = Instant::now();
        let device = &mut table.devices[idx];
        device.free_memory_mb -= memory_mb;
        device.used_memory_mb += memory_mb;
        device.allocations += 1;
        device.last_used = Some(now);
        device.refresh_utilization();

        let resource_id = format!("gpu_{}", table.next_id);
        table.next_id += 1;
        table.allocations.insert(resource_id.clone(), (device_id, memory_mb));
        tracing::trace!(device_id, memory_mb, %resource_id, "gpu allocated");

        Some(GpuAllocation {
            device_id,
            memory_mb,
            resource_id,
            allocated_at: now,
        })
    }

    /// Return an allocation. Unknown resource ids are ignored.
    pub fn release_gpu(&self, allocation: GpuAllocation) {
        let mut table = self.lock();
        let Some((device_id, memory_mb)) = table.allocations.remove(&allocation.resource_id) else {
            tracing::debug!(resource_id = %allocation.resource_id, "release of unknown gpu allocation ignored");
            return;
        };
        let Some(idx) = table.position(device_id) else {
            tracing::error!(device_id, "allocation references an unknown gpu");
            return;
        };

        let device = &mut table.devices[idx];
        debug_assert!(device.used_memory_mb >= memory_mb && device.allocations > 0);
        device.used_memory_mb = device.used_memory_mb.saturating_sub(memory_mb);
        device.free_memory_mb = (device.free_memory_mb + memory_mb).min(device.total_memory_mb);
        device.allocations = device.allocations.saturating_sub(1);
        device.refresh_utilization();
        tracing::trace!(device_id, memory_mb, resource_id = %allocation.resource_id, "gpu released");
    }

    pub fn gpu_info(&self, device_id: u32) -> Option<GpuInfo> {
        let table = self.lock();
        table.position(device_id).map(|idx| table.devices[idx].info())
    }

    pub fn all_gpus(&self) -> Vec<GpuInfo> {
        self.lock().devices.iter().map(Device::info).collect()
    }

    /// The device automatic selection would pick right now.
    pub fn best_gpu(&self) -> Option<GpuInfo> {
        let table = self.lock();
        table.best_position().map(|idx| table.devices[idx].info())
    }

    pub fn stats(&self) -> GpuStats {
        let table = self.lock();
        GpuStats {
            total_gpus: table.devices.len(),
            available_gpus: table.devices.iter().filter(|d| d.allocations == 0).count(),
            total_allocations: table.allocations.len(),
            total_memory_mb: table.devices.iter().map(|d| d.total_memory_mb).sum(),
            used_memory_mb: table.devices.iter().map(|d| d.used_memory_mb).sum(),
            failed_allocations: table.failed_allocations,
        }
    }
}
