pub mod governor;
pub mod streams;
pub mod tasks;
pub mod worker_pool;

pub use governor::{
    Admission, AdmissionStats, Governor, GovernorSnapshot, InferenceFn, InferenceRequest,
    InferenceTask, JobOutcome, WorkerStats, DEFAULT_JOB_MEMORY_MB, DEFAULT_JOB_TIMEOUT,
};
pub use tasks::Tasks;
pub use worker_pool::WorkerPool;
