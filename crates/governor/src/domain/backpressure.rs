//! Per-stream frame admission and adaptive frame-rate control.
//!
//! [`BackpressureController::should_drop_frame`] runs once per incoming frame
//! and only takes the table's read lock; per-instance state lives in atomics
//! so concurrent producers of different streams never serialize on it.
//! The adaptive FPS loop is a best-effort hill climb: reductions on
//! backpressure, slow recovery otherwise, and concurrent updates are skipped
//! rather than queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard, TryLockError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DropPolicy {
    /// The controller does not own the frame buffer, so the admit/drop
    /// decision is the same as [`DropPolicy::DropNewest`]; evicting the
    /// oldest buffered frame is up to the buffer owner.
    DropOldest,
    #[default]
    DropNewest,
    AdaptiveFps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackpressureConfig {
    pub min_fps: f64,
    /// Global ceiling no instance may exceed.
    pub max_fps_ceiling: f64,
    pub reduction_factor: f64,
    pub increase_factor: f64,
    pub adaptive_interval_ms: u64,
    /// Fraction of `max_queue_size` at which frames are dropped regardless
    /// of timing.
    pub queue_occupancy_threshold: f64,
    /// Width of the window over which `current_fps` is measured.
    pub fps_window_ms: u64,
    pub default_policy: DropPolicy,
    pub default_max_fps: f64,
    pub default_max_queue_size: usize,
}

impl BackpressureConfig {
    pub fn adaptive_interval(&self) -> Duration {
        Duration::from_millis(self.adaptive_interval_ms)
    }

    pub fn fps_window(&self) -> Duration {
        Duration::from_millis(self.fps_window_ms)
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            min_fps: 12.0,
            max_fps_ceiling: 120.0,
            reduction_factor: 0.9,
            increase_factor: 1.05,
            adaptive_interval_ms: 1_000,
            queue_occupancy_threshold: 0.8,
            fps_window_ms: 1_000,
            default_policy: DropPolicy::DropNewest,
            default_max_fps: 30.0,
            default_max_queue_size: 10,
        }
    }
}

/// Copy of one instance's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackpressureStats {
    pub instance_id: String,
    pub policy: DropPolicy,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub queue_full_count: u64,
    pub current_fps: f64,
    pub target_fps: f64,
    pub max_fps: f64,
    pub backpressure_detected: bool,
    pub current_queue_size: usize,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, Copy)]
struct InstanceSettings {
    policy: DropPolicy,
    /// Configured ceiling for recovery; the adapted target never exceeds it.
    max_fps: f64,
    max_queue_size: usize,
}

#[derive(Debug)]
struct FpsWindow {
    started: Instant,
    frames: u64,
}

const NO_FRAME: u64 = u64::MAX;

#[derive(Debug)]
struct Instance {
    settings: RwLock<InstanceSettings>,
    target_fps: AtomicF64,
    min_interval_ns: AtomicU64,
    last_admitted_ns: AtomicU64,
    current_queue_size: AtomicUsize,
    frames_processed: AtomicU64,
    frames_dropped: AtomicU64,
    queue_full_count: AtomicU64,
    /// Queue-full events since the last adaptive update.
    queue_full_pending: AtomicU64,
    backpressure_detected: AtomicBool,
    current_fps: AtomicF64,
    fps_window: Mutex<FpsWindow>,
    last_adaptive_update: Mutex<Option<Instant>>,
}

impl Instance {
    fn new(settings: InstanceSettings, now: Instant) -> Self {
        Self {
            settings: RwLock::new(settings),
            target_fps: AtomicF64::new(settings.max_fps),
            min_interval_ns: AtomicU64::new(interval_ns(settings.max_fps)),
            last_admitted_ns: AtomicU64::new(NO_FRAME),
            current_queue_size: AtomicUsize::new(0),
            frames_processed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            queue_full_count: AtomicU64::new(0),
            queue_full_pending: AtomicU64::new(0),
            backpressure_detected: AtomicBool::new(false),
            current_fps: AtomicF64::new(0.0),
            fps_window: Mutex::new(FpsWindow {
                started: now,
                frames: 0,
            }),
            last_adaptive_update: Mutex::new(None),
        }
    }

    fn settings(&self) -> InstanceSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings_mut(&self) -> RwLockWriteGuard<'_, InstanceSettings> {
        self.settings.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_target(&self, fps: f64) {
        self.target_fps.store(fps);
        self.min_interval_ns.store(interval_ns(fps), Ordering::Relaxed);
    }
}

fn interval_ns(fps: f64) -> u64 {
    if fps > 0.0 {
        (1_000_000_000.0 / fps) as u64
    } else {
        0
    }
}

/// `f64` stored as raw bits.
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

pub struct BackpressureController {
    cfg: BackpressureConfig,
    epoch: Instant,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
}

impl BackpressureController {
    pub fn new(cfg: BackpressureConfig) -> Self {
        Self::new_at(cfg, Instant::now())
    }

    pub fn new_at(cfg: BackpressureConfig, epoch: Instant) -> Self {
        Self {
            cfg,
            epoch,
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.cfg
    }

    fn nanos(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn get(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned()
    }

    /// Look up a stream for counter reporting; unknown ids are ignored.
    fn reporting(&self, instance_id: &str) -> Option<Arc<Instance>> {
        let instance = self.get(instance_id);
        if instance.is_none() {
            tracing::trace!(instance_id, "report for unconfigured stream ignored");
        }
        instance
    }

    /// Register or reconfigure a stream. `max_fps` is clamped to the
    /// controller's `[min_fps, max_fps_ceiling]`.
    ///
    /// This is the only way a stream enters the table; counter reports for
    /// unknown ids are dropped.
    pub fn configure(&self, instance_id: &str, policy: DropPolicy, max_fps: f64, max_queue_size: usize) {
        self.configure_at(instance_id, policy, max_fps, max_queue_size, Instant::now());
    }

    pub fn configure_at(
        &self,
        instance_id: &str,
        policy: DropPolicy,
        max_fps: f64,
        max_queue_size: usize,
        now: Instant,
    ) {
        debug_assert!(max_fps.is_finite(), "max_fps must be finite");
        let requested = if max_fps.is_finite() {
            max_fps
        } else {
            self.cfg.default_max_fps
        };
        let max_fps = requested.clamp(self.cfg.min_fps, self.cfg.max_fps_ceiling);
        let settings = InstanceSettings {
            policy,
            max_fps,
            max_queue_size,
        };

        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        match instances.get(instance_id) {
            Some(instance) => {
                *instance.settings_mut() = settings;
                instance.set_target(max_fps);
            }
            None => {
                instances.insert(instance_id.to_owned(), Arc::new(Instance::new(settings, now)));
            }
        }
        drop(instances);
        tracing::info!(
            instance_id,
            ?policy,
            max_fps,
            max_queue_size,
            "backpressure configured"
        );
    }

    /// Register a stream with the configured defaults.
    pub fn configure_default(&self, instance_id: &str) {
        self.configure(
            instance_id,
            self.cfg.default_policy,
            self.cfg.default_max_fps,
            self.cfg.default_max_queue_size,
        );
    }

    pub fn is_configured(&self, instance_id: &str) -> bool {
        self.get(instance_id).is_some()
    }

    /// Resize the queue bound of a configured stream, keeping its policy,
    /// FPS ceiling and current adaptive target.
    ///
    /// Returns `false` for unknown streams.
    pub fn set_max_queue_size(&self, instance_id: &str, max_queue_size: usize) -> bool {
        let Some(instance) = self.get(instance_id) else {
            return false;
        };
        let previous = std::mem::replace(&mut instance.settings_mut().max_queue_size, max_queue_size);
        if previous != max_queue_size {
            tracing::debug!(instance_id, from = previous, to = max_queue_size, "max queue size updated");
        }
        true
    }

    /// Decide whether the next frame of `instance_id` must be dropped.
    ///
    /// Does not count the drop; callers report it through
    /// [`record_frame_dropped`](Self::record_frame_dropped).
    pub fn should_drop_frame(&self, instance_id: &str) -> bool {
        self.should_drop_frame_at(instance_id, Instant::now())
    }

    pub fn should_drop_frame_at(&self, instance_id: &str, now: Instant) -> bool {
        let Some(instance) = self.get(instance_id) else {
            return false;
        };
        let settings = instance.settings();

        let queued = instance.current_queue_size.load(Ordering::Relaxed);
        if settings.max_queue_size > 0
            && queued as f64 >= self.cfg.queue_occupancy_threshold * settings.max_queue_size as f64
        {
            tracing::trace!(instance_id, queued, "frame dropped, queue nearly full");
            return true;
        }

        let now_ns = self.nanos(now);
        let last = instance.last_admitted_ns.load(Ordering::Acquire);
        if last != NO_FRAME {
            let interval = instance.min_interval_ns.load(Ordering::Relaxed);
            if now_ns.saturating_sub(last) < interval {
                return true;
            }
        }

        // a concurrent producer that wins the slot admits its frame instead
        instance
            .last_admitted_ns
            .compare_exchange(last, now_ns, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    }

    pub fn record_frame_processed(&self, instance_id: &str) {
        self.record_frame_processed_at(instance_id, Instant::now());
    }

    pub fn record_frame_processed_at(&self, instance_id: &str, now: Instant) {
        let Some(instance) = self.reporting(instance_id) else {
            return;
        };
        instance.frames_processed.fetch_add(1, Ordering::Relaxed);

        {
            let mut window = instance.fps_window.lock().unwrap_or_else(PoisonError::into_inner);
            window.frames += 1;
            let elapsed = now.saturating_duration_since(window.started);
            if elapsed >= self.cfg.fps_window() && !elapsed.is_zero() {
                let fps = (window.frames as f64 / elapsed.as_secs_f64()).round();
                instance.current_fps.store(fps);
                window.frames = 0;
                window.started = now;
            }
        }

        self.update_adaptive_fps_at(instance_id, now);
    }

    pub fn record_frame_dropped(&self, instance_id: &str) {
        let Some(instance) = self.reporting(instance_id) else {
            return;
        };
        instance.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self, instance_id: &str) {
        self.record_queue_full_at(instance_id, Instant::now());
    }

    pub fn record_queue_full_at(&self, instance_id: &str, now: Instant) {
        let Some(instance) = self.reporting(instance_id) else {
            return;
        };
        instance.queue_full_count.fetch_add(1, Ordering::Relaxed);
        instance.queue_full_pending.fetch_add(1, Ordering::Relaxed);
        instance.backpressure_detected.store(true, Ordering::Relaxed);
        tracing::debug!(instance_id, "queue full, backpressure detected");
        self.update_adaptive_fps_at(instance_id, now);
    }

    /// Report the depth of the buffer feeding `instance_id`.
    pub fn update_queue_size(&self, instance_id: &str, size: usize) {
        let Some(instance) = self.reporting(instance_id) else {
            return;
        };
        instance.current_queue_size.store(size, Ordering::Relaxed);
    }

    /// Run one step of the adaptive FPS loop.
    ///
    /// Returns `true` when the step ran; it is skipped for non-adaptive
    /// policies, within the update interval, or while another thread holds
    /// the update.
    pub fn update_adaptive_fps(&self, instance_id: &str) -> bool {
        self.update_adaptive_fps_at(instance_id, Instant::now())
    }

    pub fn update_adaptive_fps_at(&self, instance_id: &str, now: Instant) -> bool {
        let Some(instance) = self.get(instance_id) else {
            return false;
        };
        let settings = instance.settings();
        if settings.policy != DropPolicy::AdaptiveFps {
            return false;
        }

        let mut last_update = match instance.last_adaptive_update.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        if let Some(previous) = *last_update {
            if now.saturating_duration_since(previous) < self.cfg.adaptive_interval() {
                return false;
            }
        }
        *last_update = Some(now);

        let current = instance.target_fps.load();
        let pending = instance.queue_full_pending.swap(0, Ordering::Relaxed);
        let pressured = instance.backpressure_detected.swap(false, Ordering::Relaxed);

        if pressured || pending > 0 {
            let target = (current * self.cfg.reduction_factor).max(self.cfg.min_fps);
            instance.set_target(target);
            tracing::debug!(instance_id, from = current, to = target, "target fps reduced");
        } else {
            let target = (current * self.cfg.increase_factor)
                .min(settings.max_fps)
                .min(self.cfg.max_fps_ceiling);
            if target > current {
                instance.set_target(target);
                tracing::trace!(instance_id, from = current, to = target, "target fps increased");
            }
        }
        true
    }

    pub fn current_fps(&self, instance_id: &str) -> f64 {
        self.get(instance_id).map_or(0.0, |i| i.current_fps.load())
    }

    pub fn target_fps(&self, instance_id: &str) -> f64 {
        self.get(instance_id)
            .map_or(self.cfg.default_max_fps, |i| i.target_fps.load())
    }

    pub fn is_backpressure_detected(&self, instance_id: &str) -> bool {
        self.get(instance_id)
            .is_some_and(|i| i.backpressure_detected.load(Ordering::Relaxed))
    }

    pub fn stats(&self, instance_id: &str) -> Option<BackpressureStats> {
        self.get(instance_id).map(|i| Self::snapshot(instance_id, &i))
    }

    /// Stats for every known stream, ordered by instance id.
    pub fn all_stats(&self) -> Vec<BackpressureStats> {
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<_> = instances
            .iter()
            .map(|(id, instance)| Self::snapshot(id, instance))
            .collect();
        stats.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        stats
    }

    fn snapshot(instance_id: &str, instance: &Instance) -> BackpressureStats {
        let settings = instance.settings();
        BackpressureStats {
            instance_id: instance_id.to_owned(),
            policy: settings.policy,
            frames_processed: instance.frames_processed.load(Ordering::Relaxed),
            frames_dropped: instance.frames_dropped.load(Ordering::Relaxed),
            queue_full_count: instance.queue_full_count.load(Ordering::Relaxed),
            current_fps: instance.current_fps.load(),
            target_fps: instance.target_fps.load(),
            max_fps: settings.max_fps,
            backpressure_detected: instance.backpressure_detected.load(Ordering::Relaxed),
            current_queue_size: instance.current_queue_size.load(Ordering::Relaxed),
            max_queue_size: settings.max_queue_size,
        }
    }

    /// Zero the counters of `instance_id`, keeping its configuration.
    pub fn reset_stats(&self, instance_id: &str) {
        if let Some(instance) = self.get(instance_id) {
            instance.frames_processed.store(0, Ordering::Relaxed);
            instance.frames_dropped.store(0, Ordering::Relaxed);
            instance.queue_full_count.store(0, Ordering::Relaxed);
            instance.queue_full_pending.store(0, Ordering::Relaxed);
            instance.current_fps.store(0.0);
            instance.backpressure_detected.store(false, Ordering::Relaxed);
        }
    }

    pub fn remove(&self, instance_id: &str) -> bool {
        let removed = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id)
            .is_some();
        if removed {
            tracing::info!(instance_id, "backpressure instance removed");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn controller() -> (BackpressureController, Instant) {
        let now = Instant::now();
        (BackpressureController::new_at(BackpressureConfig::default(), now), now)
    }

    #[test]
    fn unconfigured_instances_are_never_dropped() {
        let (bp, now) = controller();
        for _ in 0..10 {
            assert!(!bp.should_drop_frame_at("cam", now));
        }
        bp.record_frame_dropped("cam");
        assert!(!bp.should_drop_frame_at("cam", now));
    }

    #[test]
    fn reports_for_unknown_streams_create_nothing() {
        let (bp, now) = controller();
        bp.record_frame_processed_at("ghost", now);
        bp.record_frame_dropped("ghost");
        bp.record_queue_full_at("ghost", now);
        bp.update_queue_size("ghost", 3);

        assert_eq!(bp.stats("ghost"), None);
        assert!(bp.all_stats().is_empty());
        assert!(!bp.is_configured("ghost"));
        assert!(!bp.set_max_queue_size("ghost", 5));
    }

    #[test]
    fn resizing_the_queue_keeps_the_adapted_target() {
        let (bp, now) = controller();
        bp.configure_at("cam", DropPolicy::AdaptiveFps, 30.0, 20, now);
        bp.record_queue_full_at("cam", now);
        let adapted = bp.target_fps("cam");
        assert!(adapted < 30.0);

        assert!(bp.set_max_queue_size("cam", 14));
        let stats = bp.stats("cam").expect("configured instance");
        assert_eq!(stats.max_queue_size, 14);
        assert_eq!(stats.target_fps, adapted);
        assert_eq!(stats.policy, DropPolicy::AdaptiveFps);
        assert_eq!(stats.max_fps, 30.0);

        // the smaller bound moves the occupancy trigger
        bp.update_queue_size("cam", 12);
        assert!(bp.should_drop_frame_at("cam", now + Duration::from_secs(10)));
    }

    #[test]
    fn nearly_full_queue_drops_regardless_of_timing() {
        let (bp, now) = controller();
        bp.configure_at("cam", DropPolicy::DropNewest, 30.0, 10, now);
        bp.update_queue_size("cam", 9);
        assert!(bp.should_drop_frame_at("cam", now + Duration::from_secs(10)));

        bp.update_queue_size("cam", 7);
        assert!(!bp.should_drop_frame_at("cam", now + Duration::from_secs(10)));
    }

    #[test]
    fn frames_faster_than_target_are_dropped() {
        let (bp, now) = controller();
        bp.configure_at("cam", DropPolicy::DropNewest, 20.0, 10, now);

        assert!(!bp.should_drop_frame_at("cam", now));
        assert!(bp.should_drop_frame_at("cam", now + Duration::from_millis(10)));
        assert!(bp.should_drop_frame_at("cam", now + Duration::from_millis(49)));
        assert!(!bp.should_drop_frame_at("cam", now + Duration::from_millis(50)));
    }

    #[test]
    fn drop_oldest_makes_the_same_decision_as_drop_newest() {
        let (bp, now) = controller();
        bp.configure_at("cam", DropPolicy::DropOldest, 20.0, 10, now);
        assert!(!bp.should_drop_frame_at("cam", now));
        assert!(bp.should_drop_frame_at("cam", now + Duration::from_millis(10)));
    }

    #[test]
    fn max_fps_is_clamped() {
        let (bp, now) = controller();
        bp.configure_at("fast", DropPolicy::DropNewest, 500.0, 10, now);
        bp.configure_at("slow", DropPolicy::DropNewest, 1.0, 10, now);
        assert_eq!(bp.target_fps("fast"), 120.0);
        assert_eq!(bp.target_fps("slow"), 12.0);
    }

    #[test]
    fn adaptive_fps_reduces_on_backpressure_and_recovers() {
        let (bp, now) = controller();
        bp.configure_at("cam", DropPolicy::AdaptiveFps, 30.0, 10, now);

        bp.record_queue_full_at("cam", now);
        assert!((bp.target_fps("cam") - 27.0).abs() < 1e-9);
        assert!(!bp.is_backpressure_detected("cam"));

        // within the interval nothing changes
        assert!(!bp.update_adaptive_fps_at("cam", now + Duration::from_millis(500)));

        let mut t = now;
        for _ in 0..10 {
            t += Duration::from_secs(1);
            assert!(bp.update_adaptive_fps_at("cam", t));
        }
        assert_eq!(bp.target_fps("cam"), 30.0, "recovery is capped at the configured max");
    }

    #[test]
    fn adaptive_fps_is_floored_at_min_fps() {
        let (bp, now) = controller();
        bp.configure_at("cam", DropPolicy::AdaptiveFps, 13.0, 10, now);
        let mut t = now;
        for _ in 0..5 {
            bp.record_queue_full_at("cam", t);
            t += Duration::from_secs(1);
        }
        assert_eq!(bp.target_fps("cam"), 12.0);
    }

    #[test]
    fn non_adaptive_policy_keeps_target() {
        let (bp, now) = controller();
        bp.configure_at("cam", DropPolicy::DropNewest, 30.0, 10, now);
        bp.record_queue_full_at("cam", now);
        assert_eq!(bp.target_fps("cam"), 30.0);
        assert!(bp.is_backpressure_detected("cam"));
    }

    #[test]
    fn current_fps_is_measured_per_window() {
        let (bp, now) = controller();
        bp.configure_at("cam", DropPolicy::DropNewest, 30.0, 10, now);
        for i in 1..=25u64 {
            bp.record_frame_processed_at("cam", now + Duration::from_millis(i * 40));
        }
        assert_eq!(bp.current_fps("cam"), 25.0);

        let stats = bp.stats("cam").expect("configured instance");
        assert_eq!(stats.frames_processed, 25);
        assert_eq!(stats.policy, DropPolicy::DropNewest);
    }

    #[test]
    fn reset_and_remove() {
        let (bp, now) = controller();
        bp.configure_at("cam", DropPolicy::DropNewest, 30.0, 10, now);
        bp.record_frame_dropped("cam");
        bp.record_queue_full_at("cam", now);

        bp.reset_stats("cam");
        let stats = bp.stats("cam").expect("configured instance");
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(stats.queue_full_count, 0);
        assert!(!stats.backpressure_detected);

        assert!(bp.remove("cam"));
        assert!(bp.stats("cam").is_none());
        assert!(!bp.remove("cam"));
    }

    #[test]
    fn all_stats_lists_every_instance() {
        let (bp, now) = controller();
        bp.configure_at("b", DropPolicy::DropNewest, 30.0, 10, now);
        bp.configure_at("a", DropPolicy::AdaptiveFps, 30.0, 10, now);
        let ids: Vec<_> = bp.all_stats().into_iter().map(|s| s.instance_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
