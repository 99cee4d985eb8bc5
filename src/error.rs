//! Terminal error types surfaced to callers of the governor.

use thiserror::Error;

/// The single terminal failure a caller of [`RequestGovernor::execute`] receives.
///
/// The error is `Clone` because one outcome is shared by every caller that
/// was coalesced onto the same in-flight request.
///
/// [`RequestGovernor::execute`]: crate::governor::RequestGovernor::execute
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    /// The request can never fit in the token budget.
    #[error("request costs {cost} tokens but the budget only allows {limit}")]
    CostExceedsLimit { cost: u64, limit: u64 },

    /// A throttling response arrived without the metadata needed to reschedule.
    #[error("throttling response is missing rate-limit field `{0}`")]
    MissingRateLimitField(&'static str),

    /// Transient failures persisted past the retry bound.
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Non-recoverable failure, e.g. a response without the expected structure.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The task driving an in-flight request panicked or was aborted.
    #[error("in-flight worker failed: {0}")]
    Worker(String),

    /// The concurrency gate for a resource was shut down.
    #[error("concurrency gate closed for resource {0}")]
    GateClosed(String),
}

impl GovernorError {
    /// Whether calling `execute` again with the same payload could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. } | Self::Worker(_))
    }

    /// Whether the failure is a configuration or response problem that
    /// repeating the call will not fix.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

/// Result type for governor operations.
pub type GovernorResult<T> = Result<T, GovernorError>;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The `config` crate failed to read or merge a source.
    #[error("config error: {0}")]
    Source(#[from] config::ConfigError),

    /// A required environment variable is not set.
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    /// A value was present but invalid.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
