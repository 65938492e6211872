//! Host sampling loop feeding adaptive queue sizing and limiter throttling.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

use crate::app::Governor;
use crate::domain::SystemMetrics;
use crate::{GovernorError, Result};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Build a metrics sample from raw host readings.
pub fn system_metrics(
    total_memory_bytes: u64,
    available_memory_bytes: u64,
    cpu_usage_percent: f32,
    active_instances: usize,
) -> Result<SystemMetrics, GovernorError> {
    if total_memory_bytes == 0 {
        return Err(Report::new(GovernorError::system_metrics(
            "host reports zero total memory",
        )));
    }
    let available = available_memory_bytes.min(total_memory_bytes);
    let used = total_memory_bytes - available;

    Ok(SystemMetrics {
        memory_usage_percent: used as f64 / total_memory_bytes as f64 * 100.0,
        available_memory_mb: available / BYTES_PER_MB,
        cpu_usage_percent: f64::from(cpu_usage_percent).clamp(0.0, 100.0),
        active_instances,
    })
}

pub struct SystemSampler {
    governor: Arc<Governor>,
    system: System,
}

impl SystemSampler {
    pub fn new(governor: Arc<Governor>) -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime the first reading
        system.refresh_cpu_all();
        Self { governor, system }
    }

    /// Take one host sample without publishing it.
    pub fn sample(&mut self) -> Result<SystemMetrics, GovernorError> {
        self.system.refresh_memory();
        self.system.refresh_cpu_all();
        system_metrics(
            self.system.total_memory(),
            self.system.available_memory(),
            self.system.global_cpu_usage(),
            self.governor.active_streams(),
        )
    }

    /// One control-loop tick: publish host load, refresh per-stream queue
    /// sizes and drop queued jobs nobody waits for any more.
    pub fn tick(&mut self) {
        match self.sample() {
            Ok(metrics) => {
                tracing::debug!(
                    memory_usage_percent = metrics.memory_usage_percent,
                    cpu_usage_percent = metrics.cpu_usage_percent,
                    "host sampled"
                );
                self.governor.publish_system_metrics(metrics);
            }
            Err(e) => {
                tracing::warn!("Failed to sample host metrics: {e:?}");
            }
        }
        self.governor.observe_streams();
        self.governor.purge_expired_jobs();
    }

    /// Run the sampling loop until cancelled.
    pub async fn run(mut self, update_interval: Duration, cancellation_token: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("System sampler shutdown requested");
                    break;
                }
                _ = async {
                    self.tick();
                    tokio::time::sleep(update_interval).await;
                } => {}
            }
        }
    }
}
