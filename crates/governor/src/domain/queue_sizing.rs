//! Recommended per-instance buffer depth derived from host and stream metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSizingConfig {
    pub enabled: bool,
    pub min_queue_size: usize,
    pub max_queue_size: usize,
    pub default_queue_size: usize,
    pub memory_high_percent: f64,
    pub memory_medium_percent: f64,
    pub latency_high_ms: f64,
    pub latency_medium_ms: f64,
    /// Queue-full events per second above which the buffer grows.
    pub queue_full_frequency_threshold: f64,
    /// Processing/source FPS ratio below which the buffer shrinks.
    pub processing_slow_ratio: f64,
    /// Processing/source FPS ratio above which the buffer grows.
    pub processing_fast_ratio: f64,
    /// Instance count above which every extra instance shrinks the buffer.
    pub crowding_threshold: usize,
    pub crowding_penalty: f64,
    pub min_step: usize,
}

impl Default for QueueSizingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_queue_size: 5,
            max_queue_size: 30,
            default_queue_size: 20,
            memory_high_percent: 80.0,
            memory_medium_percent: 60.0,
            latency_high_ms: 500.0,
            latency_medium_ms: 300.0,
            queue_full_frequency_threshold: 5.0,
            processing_slow_ratio: 0.8,
            processing_fast_ratio: 1.1,
            crowding_threshold: 10,
            crowding_penalty: 0.05,
            min_step: 1,
        }
    }
}

/// Host-wide snapshot published by the system sampler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemMetrics {
    pub memory_usage_percent: f64,
    pub available_memory_mb: u64,
    pub cpu_usage_percent: f64,
    pub active_instances: usize,
}

/// Per-stream snapshot published by whoever owns the stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceMetrics {
    pub current_latency_ms: f64,
    /// Queue-full events per second.
    pub queue_full_frequency: f64,
    pub processing_fps: f64,
    pub source_fps: f64,
    pub current_queue_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSizeState {
    pub instance_id: String,
    pub recommended: usize,
    pub metrics: Option<InstanceMetrics>,
}

#[derive(Debug)]
struct InstanceState {
    size: usize,
    metrics: Option<InstanceMetrics>,
    last_update: Option<Instant>,
}

/// Multiplier applied to the current size for the given metrics.
fn adjustment_factor(cfg: &QueueSizingConfig, sys: &SystemMetrics, inst: &InstanceMetrics) -> f64 {
    let mut factor = 1.0;

    if sys.memory_usage_percent > cfg.memory_high_percent {
        factor *= 0.7;
    } else if sys.memory_usage_percent > cfg.memory_medium_percent {
        factor *= 0.85;
    }

    if inst.current_latency_ms > cfg.latency_high_ms {
        factor *= 0.8;
    } else if inst.current_latency_ms > cfg.latency_medium_ms {
        factor *= 0.9;
    }

    // the system is dropping work, so grow the buffer
    if inst.queue_full_frequency > cfg.queue_full_frequency_threshold {
        factor *= 1.15;
    }

    if inst.source_fps > 0.0 && inst.processing_fps > 0.0 {
        let ratio = inst.processing_fps / inst.source_fps;
        if ratio < cfg.processing_slow_ratio {
            factor *= 0.85;
        } else if ratio > cfg.processing_fast_ratio {
            factor *= 1.1;
        }
    }

    if sys.active_instances > cfg.crowding_threshold {
        let extra = (sys.active_instances - cfg.crowding_threshold) as f64;
        factor *= 1.0 / (1.0 + extra * cfg.crowding_penalty);
    }

    factor
}

/// Next recommended size starting from `current`.
///
/// The result is clamped to `[min_queue_size, max_queue_size]`. A change
/// smaller than `min_step` in the indicated direction becomes exactly one
/// `min_step`.
pub fn compute_queue_size(
    cfg: &QueueSizingConfig,
    current: usize,
    sys: &SystemMetrics,
    inst: &InstanceMetrics,
) -> usize {
    let clamp = |size: usize| size.clamp(cfg.min_queue_size, cfg.max_queue_size);
    let factor = adjustment_factor(cfg, sys, inst);
    let proposed = clamp((current as f64 * factor).round().max(0.0) as usize);

    if proposed.abs_diff(current) >= cfg.min_step {
        return proposed;
    }
    if factor < 1.0 {
        clamp(current.saturating_sub(cfg.min_step))
    } else if factor > 1.0 {
        clamp(current.saturating_add(cfg.min_step))
    } else {
        clamp(current)
    }
}

pub struct AdaptiveQueueSizeManager {
    cfg: QueueSizingConfig,
    enabled: AtomicBool,
    system: RwLock<Option<SystemMetrics>>,
    instances: Mutex<HashMap<String, InstanceState>>,
}

impl AdaptiveQueueSizeManager {
    pub fn new(cfg: QueueSizingConfig) -> Self {
        debug_assert!(cfg.min_queue_size <= cfg.default_queue_size);
        debug_assert!(cfg.default_queue_size <= cfg.max_queue_size);
        Self {
            enabled: AtomicBool::new(cfg.enabled),
            cfg,
            system: RwLock::new(None),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QueueSizingConfig {
        &self.cfg
    }

    fn lock_instances(&self) -> MutexGuard<'_, HashMap<String, InstanceState>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn system_metrics(&self) -> Option<SystemMetrics> {
        self.system.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Buffer depth `instance_id` should use now.
    ///
    /// Until any system metrics have been published every instance gets the
    /// configured default.
    pub fn recommended_queue_size(&self, instance_id: &str) -> usize {
        if !self.is_enabled() {
            return self.cfg.default_queue_size;
        }

        let mut instances = self.lock_instances();
        if let Some(state) = instances.get(instance_id) {
            return state.size;
        }

        let Some(sys) = self.system_metrics() else {
            return self.cfg.default_queue_size;
        };
        let size = compute_queue_size(
            &self.cfg,
            self.cfg.default_queue_size,
            &sys,
            &InstanceMetrics::default(),
        );
        instances.insert(
            instance_id.to_owned(),
            InstanceState {
                size,
                metrics: None,
                last_update: None,
            },
        );
        size
    }

    pub fn update_system_metrics(&self, metrics: SystemMetrics) {
        tracing::trace!(
            memory_usage_percent = metrics.memory_usage_percent,
            cpu_usage_percent = metrics.cpu_usage_percent,
            active_instances = metrics.active_instances,
            "system metrics updated"
        );
        *self.system.write().unwrap_or_else(PoisonError::into_inner) = Some(metrics);
    }

    /// Record fresh metrics for `instance_id` and recompute its size.
    pub fn update_instance_metrics(&self, instance_id: &str, metrics: InstanceMetrics) -> usize {
        let sys = self.system_metrics().unwrap_or_default();
        let mut instances = self.lock_instances();
        let current = instances
            .get(instance_id)
            .map_or(self.cfg.default_queue_size, |s| s.size);
        let size = compute_queue_size(&self.cfg, current, &sys, &metrics);

        if size != current {
            tracing::debug!(instance_id, from = current, to = size, "recommended queue size changed");
        }
        instances.insert(
            instance_id.to_owned(),
            InstanceState {
                size,
                metrics: Some(metrics),
                last_update: Some(Instant::now()),
            },
        );
        size
    }

    /// Last computed size, or the default for unknown instances.
    pub fn current_queue_size(&self, instance_id: &str) -> usize {
        self.lock_instances()
            .get(instance_id)
            .map_or(self.cfg.default_queue_size, |s| s.size)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        tracing::info!(enabled, "adaptive queue sizing toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn reset_instance(&self, instance_id: &str) {
        self.lock_instances().remove(instance_id);
    }

    /// Instances whose metrics have not been refreshed since `cutoff`.
    pub fn stale_instances(&self, cutoff: Instant) -> Vec<String> {
        self.lock_instances()
            .iter()
            .filter(|(_, s)| s.last_update.is_some_and(|at| at < cutoff))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn states(&self) -> Vec<QueueSizeState> {
        let instances = self.lock_instances();
        let mut states: Vec<_> = instances
            .iter()
            .map(|(id, s)| QueueSizeState {
                instance_id: id.clone(),
                recommended: s.size,
                metrics: s.metrics.clone(),
            })
            .collect();
        states.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        states
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn pressured() -> SystemMetrics {
        SystemMetrics {
            memory_usage_percent: 95.0,
            available_memory_mb: 256,
            cpu_usage_percent: 90.0,
            active_instances: 40,
        }
    }

    #[test]
    fn cold_start_returns_default() {
        let manager = AdaptiveQueueSizeManager::new(QueueSizingConfig::default());
        assert_eq!(manager.recommended_queue_size("cam"), 20);
        assert_eq!(manager.current_queue_size("cam"), 20);
    }

    #[test]
    fn memory_pressure_never_goes_below_min() {
        let manager = AdaptiveQueueSizeManager::new(QueueSizingConfig::default());
        manager.update_system_metrics(pressured());
        let slow = InstanceMetrics {
            current_latency_ms: 900.0,
            processing_fps: 5.0,
            source_fps: 30.0,
            ..Default::default()
        };
        for _ in 0..20 {
            let size = manager.update_instance_metrics("cam", slow.clone());
            assert!(size >= 5, "size {size} fell below min");
        }
        assert_eq!(manager.recommended_queue_size("cam"), 5);
    }

    #[test]
    fn factors_compound() {
        let cfg = QueueSizingConfig::default();
        let sys = SystemMetrics {
            memory_usage_percent: 85.0,
            ..Default::default()
        };
        let inst = InstanceMetrics {
            current_latency_ms: 400.0,
            ..Default::default()
        };
        // 20 * 0.7 * 0.9 = 12.6
        assert_eq!(compute_queue_size(&cfg, 20, &sys, &inst), 13);
    }

    #[test]
    fn queue_full_and_fast_processing_grow_buffer() {
        let cfg = QueueSizingConfig::default();
        let inst = InstanceMetrics {
            queue_full_frequency: 8.0,
            processing_fps: 30.0,
            source_fps: 25.0,
            ..Default::default()
        };
        // 20 * 1.15 * 1.1 = 25.3
        assert_eq!(compute_queue_size(&cfg, 20, &SystemMetrics::default(), &inst), 25);
        assert_eq!(compute_queue_size(&cfg, 29, &SystemMetrics::default(), &inst), 30);
    }

    #[test]
    fn small_change_becomes_one_step() {
        let cfg = QueueSizingConfig::default();
        let sys = SystemMetrics {
            active_instances: 11,
            ..Default::default()
        };
        // 6 / 1.05 rounds back to 6; the trend still moves one step
        assert_eq!(compute_queue_size(&cfg, 6, &sys, &InstanceMetrics::default()), 5);
        assert_eq!(
            compute_queue_size(&cfg, 20, &SystemMetrics::default(), &InstanceMetrics::default()),
            20
        );
    }

    #[test]
    fn crowding_shrinks_buffer() {
        let cfg = QueueSizingConfig::default();
        let sys = SystemMetrics {
            active_instances: 30,
            ..Default::default()
        };
        // 20 / (1 + 20 * 0.05) = 10
        assert_eq!(compute_queue_size(&cfg, 20, &sys, &InstanceMetrics::default()), 10);
    }

    #[test]
    fn disabled_manager_returns_default() {
        let manager = AdaptiveQueueSizeManager::new(QueueSizingConfig::default());
        manager.update_system_metrics(pressured());
        manager.update_instance_metrics("cam", InstanceMetrics::default());
        manager.set_enabled(false);
        assert_eq!(manager.recommended_queue_size("cam"), 20);
        manager.set_enabled(true);
        assert!(manager.recommended_queue_size("cam") < 20);
    }

    #[test]
    fn reset_forgets_instance() {
        let manager = AdaptiveQueueSizeManager::new(QueueSizingConfig::default());
        manager.update_system_metrics(pressured());
        manager.update_instance_metrics("cam", InstanceMetrics::default());
        manager.reset_instance("cam");
        assert_eq!(manager.current_queue_size("cam"), 20);
        assert!(manager.states().is_empty());
    }

    #[test]
    fn stale_instances_are_reported() {
        let manager = AdaptiveQueueSizeManager::new(QueueSizingConfig::default());
        manager.update_instance_metrics("cam", InstanceMetrics::default());
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(manager.stale_instances(later), vec!["cam".to_string()]);
    }
}
