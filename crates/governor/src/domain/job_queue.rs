//! Bounded, priority-ordered job queue drained by the worker pool.
//!
//! Ordering is strict priority first, FIFO within a priority. Producers
//! block (up to their wait budget) while the queue is full and consumers
//! block while it is empty; every successful enqueue wakes one consumer and
//! every successful dequeue wakes one producer.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};

/// QoS tier of a job. Higher tiers always dequeue first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl JobPriority {
    const ALL: [JobPriority; 4] = [
        JobPriority::Low,
        JobPriority::Medium,
        JobPriority::High,
        JobPriority::Critical,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// A unit of work owned by the queue while resident.
#[derive(Debug)]
pub struct Job<T> {
    pub priority: JobPriority,
    pub id: String,
    pub task: T,
    /// Stamped by the queue when the job is accepted.
    pub enqueued_at: Instant,
    /// Advisory budget; consumers should discard jobs that outlive it.
    pub timeout: Duration,
}

impl<T> Job<T> {
    pub fn new(id: impl Into<String>, priority: JobPriority, timeout: Duration, task: T) -> Self {
        Self {
            priority,
            id: id.into(),
            task,
            enqueued_at: Instant::now(),
            timeout,
        }
    }

    /// Instant after which nobody is waiting for this job any more.
    pub fn deadline(&self) -> Option<Instant> {
        self.enqueued_at.checked_add(self.timeout)
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now > deadline)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub max_size: usize,
    /// How long a producer waits for space before giving up.
    pub enqueue_timeout_ms: u64,
    /// How long a consumer waits for work before returning empty-handed.
    pub dequeue_timeout_ms: u64,
}

impl QueueConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            enqueue_timeout_ms: 5_000,
            dequeue_timeout_ms: 5_000,
        }
    }
}

/// Point-in-time view of queue depth and composition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub max_size: usize,
    /// Enqueue attempts that timed out or found the queue full.
    pub rejected: u64,
}

type JobRank = (JobPriority, Reverse<u64>);

struct QueueState<T> {
    order: PriorityQueue<u64, JobRank>,
    jobs: HashMap<u64, Job<T>>,
    next_seq: u64,
    per_priority: [usize; 4],
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            order: PriorityQueue::new(),
            jobs: HashMap::new(),
            next_seq: 0,
            per_priority: [0; 4],
        }
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }

    fn push(&mut self, mut job: Job<T>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        job.enqueued_at = Instant::now();
        self.per_priority[job.priority.index()] += 1;
        self.order.push(seq, (job.priority, Reverse(seq)));
        self.jobs.insert(seq, job);
    }

    fn pop(&mut self) -> Option<Job<T>> {
        while let Some((seq, _)) = self.order.pop() {
            if let Some(job) = self.jobs.remove(&seq) {
                self.per_priority[job.priority.index()] -= 1;
                return Some(job);
            }
            tracing::error!(seq, "queue index referenced a missing job");
        }
        None
    }

    fn remove(&mut self, seq: u64) -> Option<Job<T>> {
        self.order.remove(&seq);
        let job = self.jobs.remove(&seq)?;
        self.per_priority[job.priority.index()] -= 1;
        Some(job)
    }
}

/// Bounded priority queue safe to share between producer and consumer threads.
pub struct PriorityJobQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    max_size: usize,
    rejected: AtomicU64,
}

impl<T> PriorityJobQueue<T> {
    pub fn new(max_size: usize) -> Self {
        debug_assert!(max_size > 0, "queue capacity must be positive");
        Self {
            state: Mutex::new(QueueState::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_size: max_size.max(1),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_config(cfg: &QueueConfig) -> Self {
        Self::new(cfg.max_size)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `job`, waiting up to `wait` for space.
    ///
    /// Returns `false` when the queue stayed full for the whole wait; a zero
    /// wait never blocks.
    pub fn enqueue(&self, job: Job<T>, wait: Duration) -> bool {
        self.offer(job, wait).is_ok()
    }

    /// Like [`enqueue`](Self::enqueue) but hands the job back on failure so
    /// the caller can retry, reroute, or account for it.
    pub fn offer(&self, job: Job<T>, wait: Duration) -> Result<(), Job<T>> {
        let mut state = self.lock();

        if state.len() >= self.max_size {
            if wait.is_zero() {
                drop(state);
                return Err(self.reject(job));
            }
            let (guard, _) = self
                .not_full
                .wait_timeout_while(state, wait, |s| s.len() >= self.max_size)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if state.len() >= self.max_size {
                drop(state);
                return Err(self.reject(job));
            }
        }

        tracing::trace!(job_id = %job.id, priority = ?job.priority, "job enqueued");
        state.push(job);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    fn reject(&self, job: Job<T>) -> Job<T> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(job_id = %job.id, max_size = self.max_size, "queue full, job rejected");
        job
    }

    /// Dequeue the highest-priority job, waiting up to `wait` for one.
    pub fn dequeue(&self, wait: Duration) -> Option<Job<T>> {
        let mut state = self.lock();

        if state.len() == 0 {
            if wait.is_zero() {
                return None;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout_while(state, wait, |s| s.len() == 0)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        let job = state.pop()?;
        drop(state);
        self.not_full.notify_one();
        Some(job)
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let count = |p: JobPriority| state.per_priority[p.index()];
        QueueStats {
            total: state.len(),
            critical: count(JobPriority::Critical),
            high: count(JobPriority::High),
            medium: count(JobPriority::Medium),
            low: count(JobPriority::Low),
            max_size: self.max_size,
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Drop every resident job and wake all blocked producers.
    ///
    /// Returns the removed jobs so the caller can account for them.
    pub fn clear(&self) -> Vec<Job<T>> {
        let mut state = self.lock();
        let mut drained = Vec::with_capacity(state.len());
        while let Some(job) = state.pop() {
            drained.push(job);
        }
        drop(state);
        self.not_full.notify_all();
        drained
    }

    /// Remove jobs whose deadline passed before `now`.
    pub fn purge_expired_at(&self, now: Instant) -> Vec<Job<T>> {
        let mut state = self.lock();
        let expired: Vec<u64> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.is_expired_at(now))
            .map(|(seq, _)| *seq)
            .collect();
        let purged: Vec<Job<T>> = expired
            .into_iter()
            .filter_map(|seq| state.remove(seq))
            .collect();
        drop(state);

        if !purged.is_empty() {
            tracing::debug!(count = purged.len(), "purged expired jobs");
            self.not_full.notify_all();
        }
        purged
    }

    pub fn purge_expired(&self) -> Vec<Job<T>> {
        self.purge_expired_at(Instant::now())
    }

    /// Resident job counts for every priority, lowest first.
    pub fn composition(&self) -> Vec<(JobPriority, usize)> {
        let state = self.lock();
        JobPriority::ALL
            .iter()
            .map(|p| (*p, state.per_priority[p.index()]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn job(id: &str, priority: JobPriority) -> Job<()> {
        Job::new(id, priority, Duration::from_secs(30), ())
    }

    #[test]
    fn dequeues_by_priority_then_fifo() {
        let queue = PriorityJobQueue::new(10);
        for (id, priority) in [
            ("low", JobPriority::Low),
            ("high-1", JobPriority::High),
            ("medium", JobPriority::Medium),
            ("critical", JobPriority::Critical),
            ("high-2", JobPriority::High),
        ] {
            assert!(queue.enqueue(job(id, priority), Duration::ZERO));
        }

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue(Duration::ZERO))
            .map(|j| j.id)
            .collect();
        let expected: Vec<String> = ["critical", "high-1", "high-2", "medium", "low"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn rejects_when_full_without_waiting() {
        let queue = PriorityJobQueue::new(3);
        for i in 0..3 {
            assert!(queue.enqueue(job(&format!("job-{i}"), JobPriority::Low), Duration::ZERO));
        }

        let started = Instant::now();
        assert!(!queue.enqueue(job("overflow", JobPriority::Critical), Duration::ZERO));
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(queue.size(), 3);
        assert_eq!(queue.stats().rejected, 1);
    }

    #[test]
    fn offer_hands_back_rejected_job() {
        let queue = PriorityJobQueue::new(1);
        assert!(queue.offer(job("first", JobPriority::Low), Duration::ZERO).is_ok());
        let returned = queue
            .offer(job("second", JobPriority::High), Duration::from_millis(10))
            .expect_err("queue should be full");
        assert_eq!(returned.id, "second");
    }

    #[test]
    fn dequeue_times_out_on_empty_queue() {
        let queue: PriorityJobQueue<()> = PriorityJobQueue::new(4);
        let started = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn blocked_producer_resumes_after_dequeue() {
        let queue = Arc::new(PriorityJobQueue::new(1));
        assert!(queue.enqueue(job("resident", JobPriority::Low), Duration::ZERO));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue(job("waiting", JobPriority::High), Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        let first = queue.dequeue(Duration::ZERO).expect("resident job");
        assert_eq!(first.id, "resident");

        assert!(producer.join().expect("producer thread"));
        assert_eq!(queue.dequeue(Duration::from_secs(1)).map(|j| j.id), Some("waiting".to_string()));
    }

    #[test]
    fn blocked_consumer_wakes_on_enqueue() {
        let queue: Arc<PriorityJobQueue<()>> = Arc::new(PriorityJobQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue(Duration::from_secs(5)).map(|j| j.id))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(queue.enqueue(job("wake", JobPriority::Medium), Duration::ZERO));
        assert_eq!(consumer.join().expect("consumer thread"), Some("wake".to_string()));
    }

    #[test]
    fn concurrent_producers_never_exceed_capacity() {
        let queue = Arc::new(PriorityJobQueue::new(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    (0..10)
                        .filter(|i| queue.enqueue(job(&format!("{t}-{i}"), JobPriority::Low), Duration::ZERO))
                        .count()
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().expect("producer")).sum();

        assert_eq!(accepted, 16);
        assert_eq!(queue.size(), 16);
        assert_eq!(queue.stats().rejected, 64);
    }

    #[test]
    fn stats_report_composition() {
        let queue = PriorityJobQueue::new(10);
        queue.enqueue(job("a", JobPriority::Critical), Duration::ZERO);
        queue.enqueue(job("b", JobPriority::High), Duration::ZERO);
        queue.enqueue(job("c", JobPriority::High), Duration::ZERO);
        queue.enqueue(job("d", JobPriority::Low), Duration::ZERO);

        assert_eq!(
            queue.stats(),
            QueueStats {
                total: 4,
                critical: 1,
                high: 2,
                medium: 0,
                low: 1,
                max_size: 10,
                rejected: 0,
            }
        );
        queue.dequeue(Duration::ZERO);
        assert_eq!(queue.stats().critical, 0);
    }

    #[test]
    fn purge_removes_only_expired_jobs() {
        let queue = PriorityJobQueue::new(10);
        queue.enqueue(Job::new("short", JobPriority::High, Duration::from_millis(10), ()), Duration::ZERO);
        queue.enqueue(Job::new("long", JobPriority::Low, Duration::from_secs(60), ()), Duration::ZERO);

        let purged = queue.purge_expired_at(Instant::now() + Duration::from_secs(1));
        assert_eq!(purged.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), vec!["short"]);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.stats().high, 0);
        assert_eq!(queue.dequeue(Duration::ZERO).map(|j| j.id), Some("long".to_string()));
    }

    #[test]
    fn clear_returns_all_jobs() {
        let queue = PriorityJobQueue::new(10);
        queue.enqueue(job("a", JobPriority::Low), Duration::ZERO);
        queue.enqueue(job("b", JobPriority::Critical), Duration::ZERO);

        let drained = queue.clear();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().critical, 0);
    }

    #[test]
    fn job_expiry_follows_timeout() {
        let job = Job::new("j", JobPriority::Low, Duration::from_millis(100), ());
        assert!(!job.is_expired_at(job.enqueued_at + Duration::from_millis(50)));
        assert!(job.is_expired_at(job.enqueued_at + Duration::from_millis(150)));
    }
}
