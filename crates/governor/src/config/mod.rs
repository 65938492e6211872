pub mod cli;
pub mod daemon;

use std::path::Path;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::domain::{
    BackpressureConfig, CacheConfig, CircuitBreakerConfig, GpuConfig, QueueConfig,
    QueueSizingConfig, RateLimitConfig,
};
use crate::{GovernorError, Result};

pub use cli::*;
pub use daemon::*;

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub threads: usize,
    /// How long an idle worker blocks on the queue before re-checking shutdown.
    pub poll_ms: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            poll_ms: 500,
        }
    }
}

/// Host sampling for adaptive sizing and throttling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// `influx` or `json`.
    pub format: String,
    pub interval_secs: u64,
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: "influx".to_string(),
            interval_secs: 10,
        }
    }
}

/// Complete governor configuration as loaded from YAML.
///
/// Every section is optional; missing sections and fields take the built-in
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GovernorConfig {
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub backpressure: BackpressureConfig,
    pub gpu: GpuConfig,
    pub queue_sizing: QueueSizingConfig,
    pub cache: CacheConfig,
    pub workers: WorkerConfig,
    pub monitor: MonitorConfig,
    pub metrics: MetricsConfig,
}

impl GovernorConfig {
    /// Reads and parses a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, GovernorError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).change_context(GovernorError::config_load(
            format!("cannot read {}", path.display()),
        ))?;
        Self::from_yaml(&raw)
            .attach_printable_lazy(|| format!("while loading {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self, GovernorError> {
        serde_yaml::from_str(raw)
            .change_context(GovernorError::config_load("malformed YAML configuration"))
    }

    pub fn to_yaml(&self) -> Result<String, GovernorError> {
        serde_yaml::to_string(self)
            .change_context(GovernorError::config_load("cannot serialize configuration"))
    }

    /// Rejects values the components cannot operate with.
    pub fn validate(&self) -> Result<(), GovernorError> {
        let mut problems = Vec::new();

        if self.queue.max_size == 0 {
            problems.push("queue.maxSize must be positive".to_string());
        }

        if self.rate_limit.max_requests == 0 {
            problems.push("rateLimit.maxRequests must be positive".to_string());
        }
        if self.rate_limit.window_secs == 0 {
            problems.push("rateLimit.windowSecs must be positive".to_string());
        }
        if self.rate_limit.max_buckets == 0 {
            problems.push("rateLimit.maxBuckets must be positive".to_string());
        }

        if self.circuit_breaker.failure_threshold == 0 {
            problems.push("circuitBreaker.failureThreshold must be positive".to_string());
        }
        if self.circuit_breaker.success_threshold == 0 {
            problems.push("circuitBreaker.successThreshold must be positive".to_string());
        }

        let bp = &self.backpressure;
        if !(bp.min_fps > 0.0 && bp.min_fps <= bp.max_fps_ceiling) {
            problems.push(format!(
                "backpressure.minFps ({}) must be positive and not above maxFpsCeiling ({})",
                bp.min_fps, bp.max_fps_ceiling
            ));
        }
        if !(bp.reduction_factor > 0.0 && bp.reduction_factor < 1.0) {
            problems.push("backpressure.reductionFactor must be in (0, 1)".to_string());
        }
        if !(bp.increase_factor.is_finite() && bp.increase_factor > 1.0) {
            problems.push("backpressure.increaseFactor must be finite and above 1".to_string());
        }
        if !(bp.queue_occupancy_threshold > 0.0 && bp.queue_occupancy_threshold <= 1.0) {
            problems.push("backpressure.queueOccupancyThreshold must be in (0, 1]".to_string());
        }
        if bp.fps_window_ms == 0 {
            problems.push("backpressure.fpsWindowMs must be positive".to_string());
        }
        if bp.default_max_queue_size == 0 {
            problems.push("backpressure.defaultMaxQueueSize must be positive".to_string());
        }

        if self.gpu.devices.is_empty() {
            problems.push("gpu.devices must list at least one device".to_string());
        }
        if self.gpu.max_concurrent_per_device == 0 {
            problems.push("gpu.maxConcurrentPerDevice must be positive".to_string());
        }

        let qs = &self.queue_sizing;
        if qs.min_queue_size == 0 || qs.min_queue_size > qs.max_queue_size {
            problems.push(format!(
                "queueSizing.minQueueSize ({}) must be positive and not above maxQueueSize ({})",
                qs.min_queue_size, qs.max_queue_size
            ));
        }
        if qs.default_queue_size < qs.min_queue_size || qs.default_queue_size > qs.max_queue_size
        {
            problems.push("queueSizing.defaultQueueSize must lie within [min, max]".to_string());
        }
        if qs.memory_medium_percent > qs.memory_high_percent {
            problems.push("queueSizing.memoryMediumPercent exceeds memoryHighPercent".to_string());
        }
        if qs.latency_medium_ms > qs.latency_high_ms {
            problems.push("queueSizing.latencyMediumMs exceeds latencyHighMs".to_string());
        }

        if self.cache.max_size == 0 {
            problems.push("cache.maxSize must be positive".to_string());
        }
        if self.cache.default_ttl_secs == 0 {
            problems.push("cache.defaultTtlSecs must be positive".to_string());
        }

        if self.workers.threads == 0 {
            problems.push("workers.threads must be positive".to_string());
        }
        if self.monitor.enabled && self.monitor.interval_secs == 0 {
            problems.push("monitor.intervalSecs must be positive".to_string());
        }
        if self.metrics.enabled && self.metrics.interval_secs == 0 {
            problems.push("metrics.intervalSecs must be positive".to_string());
        }
        if !matches!(self.metrics.format.to_lowercase().as_str(), "influx" | "json") {
            problems.push(format!(
                "metrics.format must be influx or json, got {}",
                self.metrics.format
            ));
        }

        if problems.is_empty() {
            return Ok(());
        }

        let mut report = Report::new(GovernorError::invalid_config(format!(
            "{} invalid setting(s)",
            problems.len()
        )));
        for problem in problems {
            report = report.attach_printable(problem);
        }
        Err(report)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::DropPolicy;

    #[test]
    fn defaults_are_valid() {
        let cfg = GovernorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.queue.max_size, 1000);
        assert_eq!(cfg.rate_limit.max_requests, 100);
        assert_eq!(cfg.workers.threads, 4);
        assert_eq!(cfg.metrics.format, "influx");
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg = GovernorConfig::from_yaml(
            r#"
queue:
  maxSize: 64
backpressure:
  defaultPolicy: adaptiveFps
  minFps: 5
gpu:
  devices:
    - deviceId: 0
      name: edge-a
      totalMemoryMb: 4096
    - deviceId: 1
      name: edge-b
      totalMemoryMb: 2048
"#,
        )
        .expect("should parse");

        assert_eq!(cfg.queue.max_size, 64);
        assert_eq!(cfg.queue.enqueue_timeout_ms, 5000);
        assert_eq!(cfg.backpressure.default_policy, DropPolicy::AdaptiveFps);
        assert_eq!(cfg.backpressure.min_fps, 5.0);
        assert_eq!(cfg.backpressure.max_fps_ceiling, 120.0);
        assert_eq!(cfg.gpu.devices.len(), 2);
        assert_eq!(cfg.gpu.devices[1].total_memory_mb, 2048);
        assert_eq!(cfg.cache, CacheConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "rateLimit:\n  maxRequests: 7\n  windowSecs: 1").expect("write");

        let cfg = GovernorConfig::load(file.path()).expect("should load");
        assert_eq!(cfg.rate_limit.max_requests, 7);
        assert_eq!(cfg.rate_limit.window(), Duration::from_secs(1));
    }

    #[test]
    fn load_missing_file_is_config_load_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = GovernorConfig::load(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(
            err.current_context(),
            GovernorError::ConfigLoad { .. }
        ));
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let err = GovernorConfig::from_yaml("queue: [1, 2").unwrap_err();
        assert!(matches!(
            err.current_context(),
            GovernorError::ConfigLoad { .. }
        ));
    }

    #[test]
    fn validate_rejects_nan_rates() {
        let mut cfg = GovernorConfig::default();
        cfg.backpressure.min_fps = f64::NAN;
        cfg.backpressure.increase_factor = f64::NAN;

        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err.current_context().to_string(),
            "invalid configuration: 2 invalid setting(s)".to_string()
        );

        let mut cfg = GovernorConfig::default();
        cfg.backpressure.max_fps_ceiling = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_sizes() {
        let mut cfg = GovernorConfig::default();
        cfg.queue_sizing.min_queue_size = 40;
        cfg.workers.threads = 0;

        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err.current_context(),
            GovernorError::InvalidConfiguration { .. }
        ));
        assert_eq!(
            err.current_context().to_string(),
            "invalid configuration: 3 invalid setting(s)".to_string()
        );
    }

    #[test]
    fn validate_rejects_unknown_metrics_format() {
        let mut cfg = GovernorConfig::default();
        cfg.metrics.format = "prometheus".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn yaml_round_trip_preserves_config() {
        let mut cfg = GovernorConfig::default();
        cfg.cache.max_size = 12;
        cfg.backpressure.default_policy = DropPolicy::DropOldest;

        let yaml = cfg.to_yaml().expect("serialize");
        assert!(yaml.contains("rateLimit:"));
        assert_eq!(GovernorConfig::from_yaml(&yaml).expect("parse"), cfg);
    }
}
