use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::app::governor::{Governor, InferenceTask, JobOutcome};
use crate::config::WorkerConfig;
use crate::domain::Job;

/// Fixed set of OS threads draining the governor's job queue.
pub struct WorkerPool {
    governor: Arc<Governor>,
    cancellation_token: CancellationToken,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        governor: Arc<Governor>,
        cfg: &WorkerConfig,
        cancellation_token: CancellationToken,
    ) -> Result<Self> {
        let poll = cfg.poll_interval();
        let mut workers = Vec::with_capacity(cfg.threads);
        for index in 0..cfg.threads {
            let governor = governor.clone();
            let token = cancellation_token.clone();
            let handle = thread::Builder::new()
                .name(format!("governor-worker-{index}"))
                .spawn(move || {
                    tracing::debug!(index, "worker started");
                    run_worker(&governor, poll, &token);
                    tracing::debug!(index, "worker stopped");
                })
                .with_context(|| format!("failed to spawn worker thread {index}"))?;
            workers.push(handle);
        }
        tracing::info!(threads = cfg.threads, "worker pool started");

        Ok(Self {
            governor,
            cancellation_token,
            workers,
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop the workers, wait for in-flight jobs and cancel whatever is
    /// still queued. Returns the number of cancelled jobs.
    pub fn shutdown(self) -> usize {
        self.cancellation_token.cancel();
        for worker in self.workers {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }

        let leftover = self.governor.queue().clear();
        let cancelled = leftover.len();
        for job in leftover {
            self.governor.retire(job, JobOutcome::Cancelled);
        }
        tracing::info!(cancelled, "worker pool stopped");
        cancelled
    }

    /// Run [`shutdown`](Self::shutdown) on a blocking thread and wait for it
    /// up to `timeout`. Returns `None` if the join did not finish in time;
    /// a worker stuck in an inference call is then left behind.
    pub async fn shutdown_with_timeout(self, timeout: Duration) -> Option<usize> {
        let join = tokio::task::spawn_blocking(move || self.shutdown());
        match tokio::time::timeout(timeout, join).await {
            Ok(Ok(cancelled)) => Some(cancelled),
            Ok(Err(e)) => {
                tracing::error!("Worker pool shutdown failed: {e}");
                None
            }
            Err(_) => {
                tracing::warn!("Worker pool shutdown timed out after {:?}", timeout);
                None
            }
        }
    }
}

fn run_worker(governor: &Governor, poll: Duration, token: &CancellationToken) {
    while !token.is_cancelled() {
        if let Some(job) = governor.queue().dequeue(poll) {
            process_job(governor, job);
        }
    }
}

/// Run one dequeued job end to end: stale check, GPU slot, inference,
/// release, result caching and stream accounting.
pub(crate) fn process_job(governor: &Governor, job: Job<InferenceTask>) {
    if job.is_expired() {
        governor.retire(job, JobOutcome::Expired);
        return;
    }
    let Some(allocation) = governor
        .gpu()
        .allocate_gpu(job.task.memory_mb, job.task.preferred_device)
    else {
        tracing::warn!(job_id = %job.id, memory_mb = job.task.memory_mb, "no gpu slot for job");
        governor.retire(job, JobOutcome::GpuUnavailable);
        return;
    };

    let Job { id: job_id, task, .. } = job;
    let InferenceTask {
        cache_key,
        instance_id,
        cache_ttl,
        run,
        completion,
        ..
    } = task;

    let started = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| run(&allocation)));
    let latency = started.elapsed();
    let device_id = allocation.device_id;
    governor.gpu().release_gpu(allocation);

    let counters = governor.worker_counters();
    let outcome = match result {
        Ok(Ok(value)) => {
            governor.cache().put(&cache_key, value.clone(), cache_ttl);
            if let Some(instance_id) = instance_id.as_deref() {
                governor.backpressure().record_frame_processed(instance_id);
            }
            counters.completed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%job_id, device_id, ?latency, "job completed");
            JobOutcome::Completed(value)
        }
        Ok(Err(err)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%job_id, device_id, "inference failed: {err:#}");
            JobOutcome::Failed(format!("{err:#}"))
        }
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(%job_id, device_id, "inference panicked");
            JobOutcome::Failed("inference panicked".to_string())
        }
    };

    if let Some(instance_id) = instance_id.as_deref() {
        governor.finish_stream_job(instance_id, Some(latency));
    }
    InferenceTask::complete(completion, outcome);
}
