pub mod metrics;
pub mod system_sampler;
