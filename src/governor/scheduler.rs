//! Rolling-window token budget scheduler.
//!
//! Requests are queued with their token cost and admitted once the tokens
//! consumed inside the current window leave room for them. The queue is
//! walked in FIFO order, but a request that does not fit is skipped rather
//! than blocking everything behind it. To keep a large request from starving
//! behind a stream of small ones, a request that has waited longer than
//! `reserve_after` stops the walk, so freed budget accumulates for it.
//!
//! All mutable state lives in [`SchedulerState`], owned by one
//! [`TokenBudgetScheduler`]. Independent schedulers never share budget.
//!
//! Admission never exceeds the limit as tracked here; a lowered limit can
//! leave already-admitted usage above it, and usage the server counted
//! before this process started is not visible. Both are accepted
//! approximations: overshoot is bounded by what was admitted before the
//! revision.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BudgetConfig;
use crate::error::{GovernorError, GovernorResult};

/// Shortest re-check delay; guards against a zero interval spinning.
const MIN_RECHECK: Duration = Duration::from_millis(1);

/// Current budget as last revised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    /// Tokens allowed per window.
    pub token_limit: u64,
    /// Rolling window length.
    pub window: Duration,
    /// When the server last revised the limit, if ever.
    pub revised_at: Option<Instant>,
}

/// Tokens consumed by one admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    pub tokens: u64,
    pub at: Instant,
}

/// Timing supplied by the server after a throttling rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHint {
    /// How long until the server's token budget resets.
    pub reset_in: Duration,
}

#[derive(Debug)]
struct PendingRequest {
    token_cost: u64,
    enqueued_at: Instant,
    /// Set from a rate-limit hint; not admitted before this instant.
    not_before: Option<Instant>,
    signal: oneshot::Sender<GovernorResult<()>>,
}

/// Budget, usage and admission queue for one scheduler.
#[derive(Debug)]
pub struct SchedulerState {
    config: BudgetConfig,
    rate_limit: RateLimitState,
    usage: VecDeque<UsageRecord>,
    queue: VecDeque<PendingRequest>,
    /// Deadline of the armed re-check timer.
    recheck_at: Option<Instant>,
    admitted: u64,
    revisions: u64,
}

impl SchedulerState {
    /// Create state starting from the configured limit and window.
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            rate_limit: RateLimitState {
                token_limit: config.token_limit,
                window: config.window,
                revised_at: None,
            },
            config,
            usage: VecDeque::new(),
            queue: VecDeque::new(),
            recheck_at: None,
            admitted: 0,
            revisions: 0,
        }
    }

    /// The current rate-limit state.
    pub fn rate_limit(&self) -> RateLimitState {
        self.rate_limit
    }

    /// Tokens admitted within the window ending at `now`.
    pub fn used_tokens(&self, now: Instant) -> u64 {
        let window = self.rate_limit.window;
        self.usage
            .iter()
            .filter(|record| now.saturating_duration_since(record.at) < window)
            .map(|record| record.tokens)
            .sum()
    }

    /// Number of requests waiting for admission.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue a request; the receiver resolves when it is admitted or rejected.
    ///
    /// A hinted reset is capped at one window.
    pub fn enqueue(
        &mut self,
        now: Instant,
        token_cost: u64,
        hint: Option<RateLimitHint>,
    ) -> oneshot::Receiver<GovernorResult<()>> {
        let (signal, receiver) = oneshot::channel();
        let window = self.rate_limit.window;
        self.queue.push_back(PendingRequest {
            token_cost,
            enqueued_at: now,
            not_before: hint.and_then(|h| now.checked_add(h.reset_in.min(window))),
            signal,
        });
        receiver
    }

    /// Replace the token limit. Last writer wins.
    pub fn revise(&mut self, now: Instant, token_limit: u64) {
        self.rate_limit.token_limit = token_limit;
        self.rate_limit.revised_at = Some(now);
        self.revisions += 1;
    }

    /// Drop usage older than the window plus the retention period.
    fn prune(&mut self, now: Instant) {
        let horizon = self.rate_limit.window + self.config.retention;
        while let Some(front) = self.usage.front() {
            if now.saturating_duration_since(front.at) >= horizon {
                self.usage.pop_front();
            } else {
                break;
            }
        }
    }

    /// Run one admission pass at `now`.
    ///
    /// Returns when the queue should next be re-checked, or `None` if it is
    /// empty.
    pub fn admission_pass(&mut self, now: Instant) -> Option<Instant> {
        self.prune(now);

        let limit = self.rate_limit.token_limit;
        let mut available = limit.saturating_sub(self.used_tokens(now));
        let mut reserved = false;
        let mut waiting = VecDeque::with_capacity(self.queue.len());

        while let Some(request) = self.queue.pop_front() {
            if request.signal.is_closed() {
                // Caller stopped waiting.
                continue;
            }
            if request.token_cost > limit {
                let _ = request.signal.send(Err(GovernorError::CostExceedsLimit {
                    cost: request.token_cost,
                    limit,
                }));
                continue;
            }

            let ready = request.not_before.map_or(true, |at| at <= now);
            if ready && !reserved && request.token_cost <= available {
                available -= request.token_cost;
                self.usage.push_back(UsageRecord {
                    tokens: request.token_cost,
                    at: now,
                });
                self.admitted += 1;
                let _ = request.signal.send(Ok(()));
                continue;
            }

            if ready
                && !reserved
                && now.saturating_duration_since(request.enqueued_at) >= self.config.reserve_after
            {
                debug!(
                    cost = request.token_cost,
                    available, "reserving budget for long-waiting request"
                );
                reserved = true;
            }
            waiting.push_back(request);
        }
        self.queue = waiting;

        if self.queue.is_empty() {
            return None;
        }
        let hinted = self
            .queue
            .iter()
            .filter_map(|request| request.not_before)
            .filter(|at| *at > now)
            .max();
        Some(hinted.unwrap_or(now + self.config.recheck_interval.max(MIN_RECHECK)))
    }

    /// Snapshot of the counters at `now`.
    pub fn usage(&self, now: Instant) -> SchedulerUsage {
        SchedulerUsage {
            tokens_in_window: self.used_tokens(now),
            token_limit: self.rate_limit.token_limit,
            window_ms: self.rate_limit.window.as_millis() as u64,
            queued: self.queue.len(),
            admitted: self.admitted,
            revisions: self.revisions,
        }
    }
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerUsage {
    pub tokens_in_window: u64,
    pub token_limit: u64,
    pub window_ms: u64,
    pub queued: usize,
    pub admitted: u64,
    pub revisions: u64,
}

#[derive(Debug)]
struct SchedulerInner {
    state: Mutex<SchedulerState>,
}

impl SchedulerInner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admits requests against a shared rolling token budget.
#[derive(Debug, Clone)]
pub struct TokenBudgetScheduler {
    inner: Arc<SchedulerInner>,
}

impl TokenBudgetScheduler {
    /// Create a scheduler with its own budget.
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState::new(config)),
            }),
        }
    }

    /// Wait until `token_cost` tokens are admitted.
    ///
    /// Fails immediately if the cost exceeds the current limit, and later if
    /// a revision lowers the limit below it while queued.
    pub async fn admit(&self, token_cost: u64, hint: Option<RateLimitHint>) -> GovernorResult<()> {
        let receiver = {
            let mut state = self.inner.lock_state();
            let limit = state.rate_limit.token_limit;
            if token_cost > limit {
                return Err(GovernorError::CostExceedsLimit {
                    cost: token_cost,
                    limit,
                });
            }

            let receiver = state.enqueue(Instant::now(), token_cost, hint);
            debug!(
                cost = token_cost,
                queued = state.queued(),
                hinted = hint.is_some(),
                "queued for token admission"
            );
            run_admission(&self.inner, &mut state);
            receiver
        };

        receiver.await.map_err(|_| {
            GovernorError::Fatal("scheduler dropped a pending request".to_string())
        })?
    }

    /// Replace the token limit with a server-reported value and re-run admission.
    ///
    /// Requests already admitted are never revoked.
    pub fn revise_limit(&self, token_limit: u64) {
        if token_limit == 0 {
            warn!("ignoring server-reported token limit of zero");
            return;
        }
        let mut state = self.inner.lock_state();
        let previous = state.rate_limit.token_limit;
        state.revise(Instant::now(), token_limit);
        if previous != token_limit {
            info!(previous, token_limit, "token limit revised");
        }
        run_admission(&self.inner, &mut state);
    }

    /// Current rate-limit state.
    pub fn rate_limit(&self) -> RateLimitState {
        self.inner.lock_state().rate_limit()
    }

    /// Current usage counters.
    pub fn usage(&self) -> SchedulerUsage {
        self.inner.lock_state().usage(Instant::now())
    }
}

/// Run a pass and arm a re-check timer if requests are still waiting.
fn run_admission(inner: &Arc<SchedulerInner>, state: &mut SchedulerState) {
    let Some(deadline) = state.admission_pass(Instant::now()) else {
        return;
    };
    if state.recheck_at.map_or(false, |armed| armed <= deadline) {
        return;
    }

    state.recheck_at = Some(deadline);
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        let mut state = inner.lock_state();
        if state.recheck_at == Some(deadline) {
            state.recheck_at = None;
        }
        run_admission(&inner, &mut state);
    });
}
