//! Behavioural properties of the individual governor components.

use std::time::Duration;
use std::time::Instant;

use governor::domain::AdaptiveQueueSizeManager;
use governor::domain::BackpressureConfig;
use governor::domain::BackpressureController;
use governor::domain::BreakerError;
use governor::domain::BreakerState;
use governor::domain::CacheConfig;
use governor::domain::CircuitBreaker;
use governor::domain::CircuitBreakerConfig;
use governor::domain::DropPolicy;
use governor::domain::GpuConfig;
use governor::domain::GpuDeviceConfig;
use governor::domain::GpuResourceManager;
use governor::domain::InstanceMetrics;
use governor::domain::Job;
use governor::domain::JobPriority;
use governor::domain::PriorityJobQueue;
use governor::domain::QueueSizingConfig;
use governor::domain::RateLimitConfig;
use governor::domain::ResultCache;
use governor::domain::SystemMetrics;
use governor::domain::TokenBucketLimiter;
use similar_asserts::assert_eq;

const NO_WAIT: Duration = Duration::ZERO;

fn job(id: &str, priority: JobPriority) -> Job<()> {
    Job::new(id, priority, Duration::from_secs(30), ())
}

#[test_log::test]
fn dequeue_follows_priority_then_arrival() {
    let queue = PriorityJobQueue::new(10);
    for (id, priority) in [
        ("low", JobPriority::Low),
        ("high-1", JobPriority::High),
        ("medium", JobPriority::Medium),
        ("critical", JobPriority::Critical),
        ("high-2", JobPriority::High),
    ] {
        assert!(queue.enqueue(job(id, priority), NO_WAIT));
    }

    let order: Vec<String> = std::iter::from_fn(|| queue.dequeue(NO_WAIT))
        .map(|job| job.id)
        .collect();
    assert_eq!(
        order,
        ["critical", "high-1", "high-2", "medium", "low"].map(String::from).to_vec()
    );
}

#[test_log::test]
fn queue_never_exceeds_its_bound() {
    let queue = PriorityJobQueue::new(3);
    for i in 0..3 {
        assert!(queue.enqueue(job(&format!("job-{i}"), JobPriority::Medium), NO_WAIT));
    }

    assert!(!queue.enqueue(job("overflow", JobPriority::Critical), NO_WAIT));
    assert_eq!(queue.size(), 3);
    assert_eq!(queue.stats().rejected, 1);
}

fn limiter_config() -> RateLimitConfig {
    RateLimitConfig {
        max_requests: 10,
        window_secs: 10,
        ..RateLimitConfig::default()
    }
}

#[test_log::test]
fn token_bucket_refills_after_one_window() {
    let start = Instant::now();
    let limiter = TokenBucketLimiter::new_at(limiter_config(), start);

    for _ in 0..10 {
        assert!(limiter.allow_at("c1", start));
    }
    assert!(!limiter.allow_at("c1", start));

    assert!(limiter.allow_at("c1", start + Duration::from_secs(10)));
}

#[test_log::test]
fn full_load_halves_the_quota() {
    let start = Instant::now();
    let limiter = TokenBucketLimiter::new_at(limiter_config(), start);
    limiter.set_adaptive_throttling(1.0);

    let admitted = (0..10).filter(|_| limiter.allow_at("fresh", start)).count();
    assert_eq!(admitted, 5);
}

#[test_log::test]
fn breaker_opens_cools_down_and_closes() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        timeout_ms: 100,
        success_threshold: 2,
    });
    let t = Instant::now();

    for _ in 0..3 {
        let result: Result<(), BreakerError<&str>> = breaker.execute_at(t, || Err("boom"));
        assert!(matches!(result, Err(BreakerError::Failed("boom"))));
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    let mut invoked = false;
    let rejected: Result<(), BreakerError<&str>> = breaker.execute_at(t + Duration::from_millis(50), || {
        invoked = true;
        Ok(())
    });
    assert!(rejected.is_err_and(|e| e.is_rejected()));
    assert!(!invoked);

    let retry_at = t + Duration::from_millis(150);
    assert_eq!(breaker.execute_at(retry_at, || Ok::<_, &str>(1)).ok(), Some(1));
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    assert_eq!(breaker.execute_at(retry_at, || Ok::<_, &str>(2)).ok(), Some(2));
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test_log::test]
fn nearly_full_queue_drops_frames_immediately() {
    let controller = BackpressureController::new(BackpressureConfig::default());
    controller.configure("cam", DropPolicy::DropNewest, 30.0, 10);
    controller.update_queue_size("cam", 9);

    assert!(controller.should_drop_frame("cam"));
}

#[test_log::test]
fn cached_result_expires_with_its_ttl() {
    let start = Instant::now();
    let cache = ResultCache::new_at(CacheConfig::default(), start);
    cache.put_at("k", "v".to_string(), Some(Duration::from_secs(1)), start);

    assert_eq!(cache.get_at("k", start), Some("v".to_string()));

    let later = start + Duration::from_millis(1500);
    assert_eq!(cache.get_at("k", later), None);
    assert_eq!(cache.size_at(later), 0);
}

#[test_log::test]
fn released_gpu_memory_can_be_reallocated() {
    let gpus = GpuResourceManager::new(&GpuConfig {
        max_concurrent_per_device: 4,
        devices: vec![GpuDeviceConfig {
            device_id: 0,
            name: "small".to_string(),
            total_memory_mb: 100,
        }],
    })
    .expect("valid inventory");

    let first = gpus.allocate_gpu(60, None).expect("first allocation fits");
    assert!(gpus.allocate_gpu(60, None).is_none());

    gpus.release_gpu(first);
    let third = gpus.allocate_gpu(60, None).expect("memory was returned");
    assert_eq!(third.device_id, 0);
    assert_eq!(gpus.stats().failed_allocations, 1);
}

#[test_log::test]
fn memory_pressure_never_shrinks_below_minimum() {
    let cfg = QueueSizingConfig::default();
    let manager = AdaptiveQueueSizeManager::new(cfg.clone());
    manager.update_system_metrics(SystemMetrics {
        memory_usage_percent: 95.0,
        available_memory_mb: 128,
        cpu_usage_percent: 90.0,
        active_instances: 40,
    });

    let strained = InstanceMetrics {
        current_latency_ms: 2_000.0,
        queue_full_frequency: 0.0,
        processing_fps: 2.0,
        source_fps: 30.0,
        current_queue_size: 20,
    };
    for _ in 0..50 {
        let size = manager.update_instance_metrics("cam", strained.clone());
        assert!(size >= cfg.min_queue_size);
    }
    assert_eq!(manager.recommended_queue_size("cam"), cfg.min_queue_size);
}
