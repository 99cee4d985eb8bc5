//! Retry policy around the transport call.
//!
//! Each attempt is admitted through the token scheduler before it is sent.
//! Failures fall into three branches:
//!
//! - **Throttled**: the server rejected the call with rate-limit metadata.
//!   The scheduler's limit is replaced with the reported one and the attempt
//!   re-enters the queue, not before the reported token reset. These retries
//!   do not count against `max_attempts`; they have their own cap,
//!   `max_throttled_attempts`.
//! - **Transient**: any other failure worth repeating. Retried after
//!   `attempt * base_delay` (capped), up to `max_attempts` attempts in total.
//! - **Fatal**: surfaced immediately.

use std::future::Future;

use tokio::time::sleep;
use tracing::{debug, warn};

use super::scheduler::{RateLimitHint, TokenBudgetScheduler};
use super::transport::TransportError;
use crate::config::RetryConfig;
use crate::error::{GovernorError, GovernorResult};
use crate::metrics::GovernorMetrics;

/// Bounded retry of transport calls against a token scheduler.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create a policy from configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The policy's configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `call` until it succeeds, fails fatally, or transient or throttled
    /// failures exhaust their budget.
    pub async fn execute<F, Fut, T>(
        &self,
        scheduler: &TokenBudgetScheduler,
        token_cost: u64,
        metrics: &GovernorMetrics,
        mut call: F,
    ) -> GovernorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut hint: Option<RateLimitHint> = None;
        let mut attempt: u32 = 0;
        let mut throttles: u32 = 0;

        loop {
            scheduler.admit(token_cost, hint.take()).await?;
            metrics.record_transport_call();

            let error = match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "transport call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            match error {
                TransportError::Throttled(headers) => {
                    metrics.record_throttled();
                    let info = headers.complete()?;
                    scheduler.revise_limit(info.token_limit);
                    throttles += 1;
                    if throttles >= self.config.max_throttled_attempts {
                        warn!(
                            throttles,
                            token_limit = info.token_limit,
                            "still throttled, giving up"
                        );
                        return Err(GovernorError::RetriesExhausted {
                            attempts: throttles,
                            last_error: format!(
                                "throttled by server ({} of {} tokens remaining)",
                                info.tokens_remaining, info.token_limit
                            ),
                        });
                    }
                    warn!(
                        throttles,
                        token_limit = info.token_limit,
                        tokens_remaining = info.tokens_remaining,
                        reset_ms = info.reset_tokens_in.as_millis() as u64,
                        "throttled by server, rescheduling"
                    );
                    hint = Some(RateLimitHint {
                        reset_in: info.reset_tokens_in,
                    });
                }
                TransportError::Transient(message) => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        warn!(
                            attempts = attempt,
                            error = %message,
                            "transient failures exhausted retries"
                        );
                        return Err(GovernorError::RetriesExhausted {
                            attempts: attempt,
                            last_error: message,
                        });
                    }

                    let delay = self.config.delay_for(attempt);
                    metrics.record_transient_retry();
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient failure, backing off"
                    );
                    sleep(delay).await;
                }
                TransportError::Fatal(message) => {
                    debug!(error = %message, "fatal transport failure");
                    return Err(GovernorError::Fatal(message));
                }
            }
        }
    }
}
