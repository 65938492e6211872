//! The seven governor components. None of them depends on another; they are
//! composed by [`crate::app::Governor`].

pub mod backpressure;
pub mod circuit_breaker;
pub mod gpu;
pub mod job_queue;
pub mod queue_sizing;
pub mod rate_limiter;
pub mod result_cache;

pub use backpressure::{BackpressureConfig, BackpressureController, BackpressureStats, DropPolicy};
pub use circuit_breaker::{BreakerError, BreakerState, BreakerStats, CircuitBreaker, CircuitBreakerConfig};
pub use gpu::{GpuAllocation, GpuConfig, GpuDeviceConfig, GpuInfo, GpuResourceManager, GpuStats};
pub use job_queue::{Job, JobPriority, PriorityJobQueue, QueueConfig, QueueStats};
pub use queue_sizing::{
    AdaptiveQueueSizeManager, InstanceMetrics, QueueSizeState, QueueSizingConfig, SystemMetrics,
};
pub use rate_limiter::{RateLimitConfig, RateLimiterStats, TokenBucketLimiter};
pub use result_cache::{generate_key, CacheConfig, CacheStats, ResultCache};
