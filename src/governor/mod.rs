//! Request governor for the text-generation service.
//!
//! Every summarisation call goes through one [`RequestGovernor`], which keeps
//! the crawler inside the server's token budget without the caller having to
//! think about rate limits, duplicate work or retries.
//!
//! # Overview
//!
//! The governor is assembled from:
//! - **TokenEstimator**: Approximate token cost of a payload
//! - **ContentCache**: Durable results keyed by payload digest
//! - **InFlightCoalescer**: One transport call per digest at a time
//! - **ConcurrencyGate**: Bounded concurrency per resource key
//! - **TokenBudgetScheduler**: Rolling-window admission against the token limit
//! - **RetryPolicy**: Throttled / transient / fatal failure handling
//!
//! # Example
//!
//! ```ignore
//! use pagegist::governor::{Payload, RequestGovernor};
//! use pagegist::GovernorConfig;
//!
//! let config = GovernorConfig::load(Some(Path::new("pagegist.toml")))?;
//! let governor = RequestGovernor::open(config, Arc::new(transport)).await?;
//!
//! let summary = governor
//!     .execute(Payload::new(chunk).with_instruction("Summarise this page."))
//!     .await?;
//! println!("{}", summary.text);
//! ```

mod cache;
mod coalescer;
mod engine;
mod estimator;
mod gate;
mod payload;
mod rate_limit;
mod retry;
mod scheduler;
mod transport;

pub use cache::{CacheError, CacheResult, ContentCache, FileCache, MemoryCache};
pub use coalescer::InFlightCoalescer;
pub use engine::{GovernorUsage, RequestGovernor};
pub use estimator::{EstimationMethod, TokenEstimator};
pub use gate::{ConcurrencyGate, GatePermit};
pub use payload::Payload;
pub use rate_limit::{parse_reset_duration, RateLimitHeaders, RateLimitInfo};
pub use retry::RetryPolicy;
pub use scheduler::{
    RateLimitHint, RateLimitState, SchedulerState, SchedulerUsage, TokenBudgetScheduler,
    UsageRecord,
};
pub use transport::{Completion, Transport, TransportError};
