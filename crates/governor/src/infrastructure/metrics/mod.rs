use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tokio_util::sync::CancellationToken;

use crate::app::{Governor, GovernorSnapshot};

pub mod encoders;
use encoders::{create_encoder, Measurement, MetricsEncoder};

// Wrapper struct for Vec<u8> that implements Display
pub struct BytesWrapper(Vec<u8>);

impl fmt::Display for BytesWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "");
        }

        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => {
                tracing::error!(
                    target: "metrics",
                    msg = "Failed to convert bytes to string",
                );
                Err(fmt::Error)
            }
        }
    }
}

impl From<Vec<u8>> for BytesWrapper {
    fn from(bytes: Vec<u8>) -> Self {
        BytesWrapper(bytes)
    }
}

/// Flatten a snapshot into one measurement per component, plus one per GPU
/// device and one per stream.
pub fn snapshot_measurements(snapshot: &GovernorSnapshot) -> Vec<Measurement> {
    let mut measurements = Vec::new();

    let q = &snapshot.queue;
    measurements.push(
        Measurement::new("governor_queue")
            .field("depth", q.total)
            .field("critical", q.critical)
            .field("high", q.high)
            .field("medium", q.medium)
            .field("low", q.low)
            .field("max_size", q.max_size)
            .field("rejected", q.rejected)
            .field("enqueued", snapshot.admission.enqueued)
            .field("completed", snapshot.workers.completed)
            .field("failed", snapshot.workers.failed)
            .field("stale", snapshot.workers.stale_jobs)
            .field("gpu_unavailable", snapshot.workers.gpu_unavailable),
    );

    let rl = &snapshot.rate_limiter;
    measurements.push(
        Measurement::new("governor_rate_limiter")
            .field("total_keys", rl.total_keys)
            .field("active_keys", rl.active_keys)
            .field("adaptive_factor", rl.adaptive_factor)
            .field("effective_limit", rl.effective_limit)
            .field("admitted", rl.admitted)
            .field("rejected", rl.rejected)
            .field("evicted", rl.evicted),
    );

    let cb = &snapshot.breaker;
    measurements.push(
        Measurement::new("governor_breaker")
            .tag("state", cb.state.to_string())
            .field("total_calls", cb.total_calls)
            .field("successful_calls", cb.successful_calls)
            .field("failed_calls", cb.failed_calls)
            .field("rejected_calls", cb.rejected_calls)
            .field("success_rate", cb.success_rate),
    );

    for gpu in &snapshot.gpus {
        measurements.push(
            Measurement::new("governor_gpu")
                .tag("device", gpu.device_id.to_string())
                .tag("name", gpu.name.clone())
                .field("total_memory_mb", gpu.total_memory_mb)
                .field("used_memory_mb", gpu.used_memory_mb)
                .field("free_memory_mb", gpu.free_memory_mb)
                .field("utilization_percent", gpu.utilization_percent)
                .field("allocations", gpu.allocations),
        );
    }

    for stream in &snapshot.streams {
        let mut m = Measurement::new("governor_stream")
            .tag("instance", stream.instance_id.clone())
            .field("frames_processed", stream.frames_processed)
            .field("frames_dropped", stream.frames_dropped)
            .field("queue_full_count", stream.queue_full_count)
            .field("current_fps", stream.current_fps)
            .field("target_fps", stream.target_fps)
            .field("backpressure", stream.backpressure_detected)
            .field("queue_size", stream.current_queue_size)
            .field("max_queue_size", stream.max_queue_size);
        if let Some(state) = snapshot
            .queue_sizes
            .iter()
            .find(|s| s.instance_id == stream.instance_id)
        {
            m = m.field("recommended_queue_size", state.recommended);
        }
        measurements.push(m);
    }

    let cache = &snapshot.cache;
    measurements.push(
        Measurement::new("governor_cache")
            .field("entries", cache.entries)
            .field("max_size", cache.max_size)
            .field("hits", cache.hits)
            .field("misses", cache.misses)
            .field("hit_rate", cache.hit_rate)
            .field("evictions", cache.evictions)
            .field("expirations", cache.expirations),
    );

    measurements
}

/// Encode and emit one line per measurement on the metrics target.
pub fn report<E: MetricsEncoder>(encoder: &E, snapshot: &GovernorSnapshot, timestamp: i64) -> usize {
    let measurements = snapshot_measurements(snapshot);
    for measurement in &measurements {
        let metrics_str = encoder.encode_measurement(measurement, timestamp);
        tracing::info!(
            target: "metrics",
            msg = %metrics_str,
        );
    }
    measurements.len()
}

/// Periodically report governor counters until cancelled.
pub async fn run_metrics(
    governor: Arc<Governor>,
    metrics_format: &str,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    let encoder = create_encoder(metrics_format);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                tracing::info!("Metrics reporter shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let lines = report(&encoder, &governor.snapshot(), current_time());
                tracing::trace!(lines, "metrics reported");
            }
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
