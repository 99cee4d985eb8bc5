//! The request governor façade.
//!
//! `execute` runs the full pipeline for one payload: cache lookup, in-flight
//! coalescing on the payload digest, the concurrency gate, token admission
//! with retries, and a write-through to the cache on success.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::cache::{CacheError, ContentCache, FileCache};
use super::coalescer::InFlightCoalescer;
use super::estimator::TokenEstimator;
use super::gate::ConcurrencyGate;
use super::payload::Payload;
use super::retry::RetryPolicy;
use super::scheduler::{SchedulerUsage, TokenBudgetScheduler};
use super::transport::{Completion, Transport};
use crate::config::{GovernorConfig, TEXT_GENERATION_RESOURCE};
use crate::error::{GovernorError, GovernorResult};
use crate::metrics::{GovernorMetrics, MetricsSnapshot};

/// Combined view of scheduler and request counters.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorUsage {
    pub scheduler: SchedulerUsage,
    pub metrics: MetricsSnapshot,
    /// Digests with a transport call currently running.
    pub in_flight: usize,
}

/// Rate-limited, cached, deduplicated access to a text-generation transport.
///
/// Cloning is cheap; clones share the cache, budget, gate and in-flight map.
#[derive(Clone)]
pub struct RequestGovernor {
    cache: Arc<dyn ContentCache>,
    transport: Arc<dyn Transport>,
    scheduler: TokenBudgetScheduler,
    gate: Arc<ConcurrencyGate>,
    coalescer: InFlightCoalescer<Completion>,
    estimator: TokenEstimator,
    retry: RetryPolicy,
    metrics: Arc<GovernorMetrics>,
    resource: String,
}

impl std::fmt::Debug for RequestGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGovernor")
            .field("resource", &self.resource)
            .field("scheduler", &self.scheduler)
            .field("coalescer", &self.coalescer)
            .finish_non_exhaustive()
    }
}

impl RequestGovernor {
    /// Build a governor with its own scheduler, gate and coalescer.
    pub fn new(
        config: GovernorConfig,
        cache: Arc<dyn ContentCache>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            cache,
            transport,
            scheduler: TokenBudgetScheduler::new(config.budget.clone()),
            gate: Arc::new(ConcurrencyGate::new(config.gates.clone())),
            coalescer: InFlightCoalescer::new(),
            estimator: TokenEstimator::from_config(&config.estimator),
            retry: RetryPolicy::new(config.retry.clone()),
            metrics: Arc::new(GovernorMetrics::new()),
            resource: TEXT_GENERATION_RESOURCE.to_string(),
        }
    }

    /// Build a governor backed by a [`FileCache`] in the configured directory.
    pub async fn open(
        config: GovernorConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CacheError> {
        let cache = FileCache::open(&config.cache.dir).await?;
        Ok(Self::new(config, Arc::new(cache), transport))
    }

    /// Gate transport calls under `resource` instead of the default key.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Share an existing gate, e.g. with a page fetcher.
    pub fn with_gate(mut self, gate: Arc<ConcurrencyGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Return the completion for `payload`, calling the transport at most
    /// once per digest across concurrent callers.
    pub async fn execute(&self, payload: Payload) -> GovernorResult<Completion> {
        self.metrics.record_execution();
        let digest = payload.digest();

        if let Some(hit) = self.cached(&digest).await {
            debug!(digest = %digest, "cache hit");
            self.metrics.record_cache_hit();
            return Ok(hit);
        }
        self.metrics.record_cache_miss();

        let cost = self.estimator.estimate_payload(&payload);
        let work = self.clone();
        let key = digest.clone();
        let (outcome, joined) = self
            .coalescer
            .run_exclusive(&digest, move || async move {
                work.call_through(key, payload, cost).await
            })
            .await;

        if joined {
            debug!(digest = %digest, "joined in-flight request");
            self.metrics.record_coalesced_join();
        }
        if let Err(err) = &outcome {
            if !joined {
                self.metrics.record_failure();
            }
            warn!(digest = %digest, error = %err, "request failed");
        }
        outcome
    }

    /// The uncached path, run once per digest inside the coalescer.
    async fn call_through(
        &self,
        digest: String,
        payload: Payload,
        cost: u64,
    ) -> GovernorResult<Completion> {
        // A caller that just finished this digest may have raced our lookup.
        if let Some(hit) = self.cached(&digest).await {
            return Ok(hit);
        }

        let permit = self.gate.acquire(&self.resource).await?;
        let transport = Arc::clone(&self.transport);
        let completion = self
            .retry
            .execute(&self.scheduler, cost, &self.metrics, || transport.send(&payload))
            .await?;
        permit.release();

        if let Err(err) = self.cache.set(&digest, &completion).await {
            warn!(digest = %digest, error = %err, "failed to write cache entry");
        } else {
            info!(digest = %digest, cost, "cached new completion");
        }
        Ok(completion)
    }

    /// Cache lookup that treats read failures as misses.
    async fn cached(&self, digest: &str) -> Option<Completion> {
        match self.cache.get(digest).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(digest, error = %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Estimated token cost of `payload`.
    pub fn estimate(&self, payload: &Payload) -> u64 {
        self.estimator.estimate_payload(payload)
    }

    /// Fail fast on payloads that can never fit the current budget.
    pub fn check_fits(&self, payload: &Payload) -> GovernorResult<u64> {
        let cost = self.estimate(payload);
        let limit = self.scheduler.rate_limit().token_limit;
        if cost > limit {
            return Err(GovernorError::CostExceedsLimit { cost, limit });
        }
        Ok(cost)
    }

    /// The token scheduler.
    pub fn scheduler(&self) -> &TokenBudgetScheduler {
        &self.scheduler
    }

    /// The concurrency gate.
    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// The gate key used for transport calls.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Snapshot of budget and request counters.
    pub fn usage(&self) -> GovernorUsage {
        GovernorUsage {
            scheduler: self.scheduler.usage(),
            metrics: self.metrics.snapshot(),
            in_flight: self.coalescer.in_flight(),
        }
    }
}
