//! Per-stream bookkeeping shared by admission, the workers and the sampler.
//!
//! Tracks how many jobs of each stream are queued or running (the depth the
//! backpressure occupancy trigger looks at), a smoothed completion latency,
//! and the counters needed to turn backpressure totals into rates.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::domain::{BackpressureStats, InstanceMetrics};

/// Weight of the newest latency sample.
const LATENCY_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    frames_seen: u64,
    queue_full: u64,
}

#[derive(Debug, Default)]
struct StreamState {
    in_flight: usize,
    latency_ms: Option<f64>,
    last_sample: Option<Sample>,
}

#[derive(Debug, Default)]
pub struct StreamTracker {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl StreamTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the stream's depth including the new job.
    pub fn job_enqueued(&self, instance_id: &str) -> usize {
        let mut streams = self.lock();
        let state = streams.entry(instance_id.to_owned()).or_default();
        state.in_flight += 1;
        state.in_flight
    }

    /// Returns the remaining depth. `latency` is only given for jobs that ran.
    pub fn job_finished(&self, instance_id: &str, latency: Option<Duration>) -> usize {
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(instance_id) else {
            tracing::error!(instance_id, "finished job of an untracked stream");
            return 0;
        };
        debug_assert!(state.in_flight > 0, "stream depth underflow");
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(latency) = latency {
            let sample = latency.as_secs_f64() * 1000.0;
            state.latency_ms = Some(match state.latency_ms {
                Some(prev) => prev + LATENCY_ALPHA * (sample - prev),
                None => sample,
            });
        }
        state.in_flight
    }

    pub fn depth(&self, instance_id: &str) -> usize {
        self.lock().get(instance_id).map_or(0, |s| s.in_flight)
    }

    pub fn latency_ms(&self, instance_id: &str) -> Option<f64> {
        self.lock().get(instance_id).and_then(|s| s.latency_ms)
    }

    /// Derive rate metrics from two consecutive backpressure snapshots.
    ///
    /// The first observation of a stream only records a baseline and yields
    /// `None`.
    pub fn observe_at(&self, stats: &BackpressureStats, now: Instant) -> Option<InstanceMetrics> {
        let mut streams = self.lock();
        let state = streams.entry(stats.instance_id.clone()).or_default();
        let current = Sample {
            at: now,
            frames_seen: stats.frames_processed + stats.frames_dropped,
            queue_full: stats.queue_full_count,
        };
        let previous = state.last_sample.replace(current)?;

        let elapsed = now.saturating_duration_since(previous.at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        // counters restart after reset_stats
        let frames = current.frames_seen.saturating_sub(previous.frames_seen);
        let queue_full = current.queue_full.saturating_sub(previous.queue_full);

        Some(InstanceMetrics {
            current_latency_ms: state.latency_ms.unwrap_or(0.0),
            queue_full_frequency: queue_full as f64 / elapsed,
            processing_fps: stats.current_fps,
            source_fps: frames as f64 / elapsed,
            current_queue_size: state.in_flight,
        })
    }

    pub fn remove(&self, instance_id: &str) {
        self.lock().remove(instance_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
