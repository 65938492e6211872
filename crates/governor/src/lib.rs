//! Request governor for an edge inference server.
//!
//! Decides for every incoming job whether to admit, delay, throttle or reject
//! it, and arbitrates access to GPU resources under load.

use error_stack::Report;

pub mod app;
pub mod config;
pub mod domain;
mod error;
pub mod infrastructure;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

pub use app::{Admission, Governor, InferenceRequest, WorkerPool};
pub use config::GovernorConfig;
pub use error::GovernorError;
