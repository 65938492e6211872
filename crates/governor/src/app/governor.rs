//! Admission facade composing the seven governor components.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use error_stack::Report;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::app::streams::StreamTracker;
use crate::config::GovernorConfig;
use crate::domain::{
    generate_key, AdaptiveQueueSizeManager, BackpressureController, BackpressureStats,
    BreakerError, BreakerStats, CacheStats, CircuitBreaker, DropPolicy, GpuAllocation, GpuInfo,
    GpuResourceManager, GpuStats, Job, JobPriority, PriorityJobQueue, QueueSizeState, QueueStats,
    RateLimiterStats, ResultCache, SystemMetrics, TokenBucketLimiter,
};
use crate::{GovernorError, Result};

/// Job timeout used when a request does not carry its own.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// GPU memory reserved for a request that does not state its needs.
pub const DEFAULT_JOB_MEMORY_MB: u64 = 256;

/// The inference work itself. Runs on a worker thread while holding the GPU
/// allocation it is given.
pub type InferenceFn = Box<dyn FnOnce(&GpuAllocation) -> anyhow::Result<String> + Send + 'static>;

/// Final state of an admitted job, delivered through its completion channel.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(String),
    Failed(String),
    /// No GPU slot could be allocated when the job reached a worker.
    GpuUnavailable,
    /// The job outlived its timeout while queued.
    Expired,
    /// The pool shut down before the job ran.
    Cancelled,
}

/// An inbound inference request.
pub struct InferenceRequest {
    /// Rate-limit key, typically the client identity.
    pub client_key: String,
    /// Set for frames of a video stream; enables frame dropping.
    pub instance_id: Option<String>,
    pub priority: JobPriority,
    pub input: String,
    pub model_config: String,
    pub memory_mb: u64,
    pub preferred_device: Option<u32>,
    pub timeout: Duration,
    /// TTL of the cached result; `None` uses the cache default.
    pub cache_ttl: Option<Duration>,
    pub run: InferenceFn,
}

impl InferenceRequest {
    pub fn new<F>(client_key: impl Into<String>, input: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(&GpuAllocation) -> anyhow::Result<String> + Send + 'static,
    {
        Self {
            client_key: client_key.into(),
            instance_id: None,
            priority: JobPriority::Medium,
            input: input.into(),
            model_config: String::new(),
            memory_mb: DEFAULT_JOB_MEMORY_MB,
            preferred_device: None,
            timeout: DEFAULT_JOB_TIMEOUT,
            cache_ttl: None,
            run: Box::new(run),
        }
    }

    pub fn from_stream(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_model_config(mut self, model_config: impl Into<String>) -> Self {
        self.model_config = model_config.into();
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_preferred_device(mut self, device_id: u32) -> Self {
        self.preferred_device = Some(device_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

impl fmt::Debug for InferenceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("client_key", &self.client_key)
            .field("instance_id", &self.instance_id)
            .field("priority", &self.priority)
            .field("memory_mb", &self.memory_mb)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Queue payload of an admitted request.
pub struct InferenceTask {
    pub cache_key: String,
    pub instance_id: Option<String>,
    pub memory_mb: u64,
    pub preferred_device: Option<u32>,
    pub cache_ttl: Option<Duration>,
    pub(crate) run: InferenceFn,
    pub(crate) completion: Option<oneshot::Sender<JobOutcome>>,
}

impl InferenceTask {
    /// Deliver the outcome; a caller that stopped waiting is not an error.
    pub(crate) fn complete(completion: Option<oneshot::Sender<JobOutcome>>, outcome: JobOutcome) {
        if let Some(tx) = completion {
            let _ = tx.send(outcome);
        }
    }
}

impl fmt::Debug for InferenceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceTask")
            .field("cache_key", &self.cache_key)
            .field("instance_id", &self.instance_id)
            .field("memory_mb", &self.memory_mb)
            .finish_non_exhaustive()
    }
}

/// Result of [`Governor::admit`]. Every variant except `Enqueued` and
/// `Cached` means the request was turned away and has been counted.
#[derive(Debug)]
pub enum Admission {
    RateLimited,
    Cached(String),
    FrameDropped,
    Enqueued {
        job_id: String,
        completion: oneshot::Receiver<JobOutcome>,
    },
    QueueFull,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Cached(_) | Admission::Enqueued { .. })
    }
}

#[derive(Debug, Default)]
struct AdmissionCounters {
    enqueued: AtomicU64,
    cached: AtomicU64,
    rate_limited: AtomicU64,
    frames_dropped: AtomicU64,
    queue_full: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdmissionStats {
    pub enqueued: u64,
    pub cached: u64,
    pub rate_limited: u64,
    pub frames_dropped: u64,
    pub queue_full: u64,
}

/// Outcome counters maintained by the worker pool.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub stale_jobs: AtomicU64,
    pub gpu_unavailable: AtomicU64,
    pub cancelled: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    pub stale_jobs: u64,
    pub gpu_unavailable: u64,
    pub cancelled: u64,
}

impl WorkerCounters {
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale_jobs: self.stale_jobs.load(Ordering::Relaxed),
            gpu_unavailable: self.gpu_unavailable.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every component's counters.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorSnapshot {
    pub admission: AdmissionStats,
    pub queue: QueueStats,
    pub rate_limiter: RateLimiterStats,
    pub breaker: BreakerStats,
    pub gpu: GpuStats,
    pub gpus: Vec<GpuInfo>,
    pub streams: Vec<BackpressureStats>,
    pub queue_sizes: Vec<QueueSizeState>,
    pub cache: CacheStats,
    pub workers: WorkerStats,
}

/// Request governor: admits jobs into the queue that the
/// [`WorkerPool`](crate::app::WorkerPool) drains.
pub struct Governor {
    queue: Arc<PriorityJobQueue<InferenceTask>>,
    limiter: Arc<TokenBucketLimiter>,
    breaker: Arc<CircuitBreaker>,
    backpressure: Arc<BackpressureController>,
    gpu: Arc<GpuResourceManager>,
    queue_sizing: Arc<AdaptiveQueueSizeManager>,
    cache: Arc<ResultCache<String>>,
    streams: StreamTracker,
    enqueue_wait: Duration,
    admission: AdmissionCounters,
    workers: WorkerCounters,
}

impl Governor {
    pub fn new(cfg: &GovernorConfig) -> Result<Self, GovernorError> {
        Ok(Self {
            queue: Arc::new(PriorityJobQueue::with_config(&cfg.queue)),
            limiter: Arc::new(TokenBucketLimiter::new(cfg.rate_limit.clone())),
            breaker: Arc::new(CircuitBreaker::new(cfg.circuit_breaker.clone())),
            backpressure: Arc::new(BackpressureController::new(cfg.backpressure.clone())),
            gpu: Arc::new(GpuResourceManager::new(&cfg.gpu)?),
            queue_sizing: Arc::new(AdaptiveQueueSizeManager::new(cfg.queue_sizing.clone())),
            cache: Arc::new(ResultCache::new(cfg.cache.clone())),
            streams: StreamTracker::default(),
            enqueue_wait: cfg.queue.enqueue_timeout(),
            admission: AdmissionCounters::default(),
            workers: WorkerCounters::default(),
        })
    }

    pub fn queue(&self) -> &Arc<PriorityJobQueue<InferenceTask>> {
        &self.queue
    }

    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn backpressure(&self) -> &Arc<BackpressureController> {
        &self.backpressure
    }

    pub fn gpu(&self) -> &Arc<GpuResourceManager> {
        &self.gpu
    }

    pub fn queue_sizing(&self) -> &Arc<AdaptiveQueueSizeManager> {
        &self.queue_sizing
    }

    pub fn cache(&self) -> &Arc<ResultCache<String>> {
        &self.cache
    }

    pub fn worker_counters(&self) -> &WorkerCounters {
        &self.workers
    }

    /// Register a stream for frame dropping. The per-stream buffer bound is
    /// the queue size currently recommended for it.
    pub fn register_stream(&self, instance_id: &str, policy: DropPolicy, max_fps: f64) {
        let max_queue_size = self.queue_sizing.recommended_queue_size(instance_id);
        self.backpressure
            .configure(instance_id, policy, max_fps, max_queue_size);
    }

    pub fn register_stream_default(&self, instance_id: &str) {
        let cfg = self.backpressure.config();
        let (policy, max_fps) = (cfg.default_policy, cfg.default_max_fps);
        self.register_stream(instance_id, policy, max_fps);
    }

    pub fn remove_stream(&self, instance_id: &str) {
        self.backpressure.remove(instance_id);
        self.queue_sizing.reset_instance(instance_id);
        self.streams.remove(instance_id);
        tracing::info!(instance_id, "stream removed");
    }

    /// Run the admission pipeline for one request: rate limit, cached
    /// result, frame dropping for streams, then the priority queue.
    pub fn admit(&self, request: InferenceRequest) -> Result<Admission, GovernorError> {
        if request.memory_mb == 0 {
            return Err(Report::new(GovernorError::invalid_argument(
                "request must reserve a positive amount of gpu memory",
            ))
            .attach_printable(format!("client key: {}", request.client_key)));
        }

        if !self.limiter.allow(&request.client_key) {
            self.admission.rate_limited.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(client_key = %request.client_key, "request rate limited");
            return Ok(Admission::RateLimited);
        }

        let cache_key = generate_key(&request.input, &request.model_config);
        if let Some(result) = self.cache.get(&cache_key) {
            self.admission.cached.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%cache_key, "served from cache");
            return Ok(Admission::Cached(result));
        }

        let tracked = match request.instance_id.as_deref() {
            Some(instance_id) if self.backpressure.is_configured(instance_id) => {
                if self.backpressure.should_drop_frame(instance_id) {
                    self.backpressure.record_frame_dropped(instance_id);
                    self.admission.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(instance_id, "frame dropped");
                    return Ok(Admission::FrameDropped);
                }
                let depth = self.streams.job_enqueued(instance_id);
                self.backpressure.update_queue_size(instance_id, depth);
                true
            }
            Some(instance_id) => {
                tracing::trace!(instance_id, "frame of unregistered stream admitted untracked");
                false
            }
            None => false,
        };

        let job_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let InferenceRequest {
            instance_id,
            priority,
            memory_mb,
            preferred_device,
            timeout,
            cache_ttl,
            run,
            ..
        } = request;
        let task = InferenceTask {
            cache_key,
            instance_id: instance_id.filter(|_| tracked),
            memory_mb,
            preferred_device,
            cache_ttl,
            run,
            completion: Some(tx),
        };

        match self
            .queue
            .offer(Job::new(job_id.clone(), priority, timeout, task), self.enqueue_wait)
        {
            Ok(()) => {
                self.admission.enqueued.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%job_id, ?priority, "job enqueued");
                Ok(Admission::Enqueued {
                    job_id,
                    completion: rx,
                })
            }
            Err(job) => {
                self.admission.queue_full.fetch_add(1, Ordering::Relaxed);
                if let Some(instance_id) = job.task.instance_id.as_deref() {
                    self.finish_stream_job(instance_id, None);
                    self.backpressure.record_queue_full(instance_id);
                }
                tracing::warn!(%job_id, ?priority, "job queue full");
                Ok(Admission::QueueFull)
            }
        }
    }

    /// Call an unreliable downstream through the shared circuit breaker.
    pub fn call_external<T, E, F>(&self, f: F) -> core::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> core::result::Result<T, E>,
    {
        self.breaker.execute(f)
    }

    pub fn set_load_factor(&self, load_factor: f64) {
        self.limiter.set_adaptive_throttling(load_factor);
    }

    /// Feed a host sample to queue sizing and derive the limiter's load
    /// factor from the busier of memory and CPU.
    pub fn publish_system_metrics(&self, metrics: SystemMetrics) {
        let load = metrics
            .memory_usage_percent
            .max(metrics.cpu_usage_percent)
            .clamp(0.0, 100.0)
            / 100.0;
        self.queue_sizing.update_system_metrics(metrics);
        self.set_load_factor(load);
    }

    pub fn active_streams(&self) -> usize {
        self.backpressure.all_stats().len()
    }

    /// Turn per-stream counters into rates, recompute each stream's
    /// recommended queue size and apply it as the stream's backpressure
    /// bound. Returns the streams that were updated.
    pub fn observe_streams(&self) -> usize {
        self.observe_streams_at(Instant::now())
    }

    pub fn observe_streams_at(&self, now: Instant) -> usize {
        let mut updated = 0;
        for stats in self.backpressure.all_stats() {
            if let Some(metrics) = self.streams.observe_at(&stats, now) {
                let size = self
                    .queue_sizing
                    .update_instance_metrics(&stats.instance_id, metrics);
                self.backpressure.set_max_queue_size(&stats.instance_id, size);
                tracing::debug!(instance_id = %stats.instance_id, size, "queue size recomputed");
                updated += 1;
            }
        }
        updated
    }

    /// Called by workers when a stream job leaves the system.
    pub(crate) fn finish_stream_job(&self, instance_id: &str, latency: Option<Duration>) {
        let depth = self.streams.job_finished(instance_id, latency);
        self.backpressure.update_queue_size(instance_id, depth);
    }

    /// Settle a job that will never run, counting it under its outcome.
    pub(crate) fn retire(&self, job: Job<InferenceTask>, outcome: JobOutcome) {
        let counter = match outcome {
            JobOutcome::Expired => &self.workers.stale_jobs,
            JobOutcome::GpuUnavailable => &self.workers.gpu_unavailable,
            JobOutcome::Cancelled => &self.workers.cancelled,
            JobOutcome::Completed(_) | JobOutcome::Failed(_) => {
                tracing::error!(job_id = %job.id, "retire called for a job that ran");
                &self.workers.failed
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(job_id = %job.id, ?outcome, "job retired without running");

        let InferenceTask {
            instance_id,
            completion,
            ..
        } = job.task;
        if let Some(instance_id) = instance_id.as_deref() {
            self.finish_stream_job(instance_id, None);
        }
        InferenceTask::complete(completion, outcome);
    }

    /// Remove queued jobs whose timeout has passed. Returns how many.
    pub fn purge_expired_jobs(&self) -> usize {
        let expired = self.queue.purge_expired();
        let count = expired.len();
        for job in expired {
            self.retire(job, JobOutcome::Expired);
        }
        if count > 0 {
            tracing::info!(count, "purged expired jobs");
        }
        count
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        GovernorSnapshot {
            admission: AdmissionStats {
                enqueued: self.admission.enqueued.load(Ordering::Relaxed),
                cached: self.admission.cached.load(Ordering::Relaxed),
                rate_limited: self.admission.rate_limited.load(Ordering::Relaxed),
                frames_dropped: self.admission.frames_dropped.load(Ordering::Relaxed),
                queue_full: self.admission.queue_full.load(Ordering::Relaxed),
            },
            queue: self.queue.stats(),
            rate_limiter: self.limiter.stats(),
            breaker: self.breaker.stats(),
            gpu: self.gpu.stats(),
            gpus: self.gpu.all_gpus(),
            streams: self.backpressure.all_stats(),
            queue_sizes: self.queue_sizing.states(),
            cache: self.cache.stats(),
            workers: self.workers.snapshot(),
        }
    }
}
