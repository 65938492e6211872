use derive_more::Display;

/// Error type shared by the governor components.
///
/// Capacity outcomes (full queue, exhausted quota, no GPU slot) are not
/// errors and never surface through this type.
#[derive(Debug, Display)]
pub enum GovernorError {
    /// Configuration is invalid or inconsistent.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
    /// Configuration could not be read or parsed.
    #[display("failed to load configuration: {reason}")]
    ConfigLoad { reason: String },
    /// A caller passed a value that violates an operation's contract.
    #[display("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    /// Host metrics could not be sampled.
    #[display("system metrics unavailable: {reason}")]
    SystemMetrics { reason: String },
}

impl core::error::Error for GovernorError {}

impl GovernorError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn config_load(reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn system_metrics(reason: impl Into<String>) -> Self {
        Self::SystemMetrics {
            reason: reason.into(),
        }
    }
}
