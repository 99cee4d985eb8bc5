//! Request counters for the governor.
//!
//! Counters are plain atomics so every layer (engine, retry loop) can record
//! without locking; [`GovernorMetrics::snapshot`] produces a serialisable
//! copy for reporting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by one governor.
#[derive(Debug, Default)]
pub struct GovernorMetrics {
    executions: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced_joins: AtomicU64,
    transport_calls: AtomicU64,
    throttled: AtomicU64,
    transient_retries: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`GovernorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Calls to `execute`
    pub executions: u64,
    /// Results served from the cache
    pub cache_hits: u64,
    /// Lookups that found nothing
    pub cache_misses: u64,
    /// Callers that waited on another caller's in-flight request
    pub coalesced_joins: u64,
    /// Transport attempts, including retries
    pub transport_calls: u64,
    /// Throttling rejections from the server
    pub throttled: u64,
    /// Transient failures that were retried
    pub transient_retries: u64,
    /// Executions that ended in an error
    pub failures: u64,
}

impl MetricsSnapshot {
    /// Fraction of executions answered from the cache.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.executions as f64
    }
}

impl GovernorMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced_join(&self) {
        self.coalesced_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_call(&self) {
        self.transport_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_retry(&self) {
        self.transient_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesced_joins: self.coalesced_joins.load(Ordering::Relaxed),
            transport_calls: self.transport_calls.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Render a snapshot as a short human-readable report.
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    let mut output = String::new();
    output.push_str("Request Metrics\n");
    output.push_str("===============\n");
    output.push_str(&format!("Executions:        {}\n", snapshot.executions));
    output.push_str(&format!(
        "Cache Hits:        {} ({:.1}%)\n",
        snapshot.cache_hits,
        snapshot.cache_hit_rate() * 100.0
    ));
    output.push_str(&format!("Cache Misses:      {}\n", snapshot.cache_misses));
    output.push_str(&format!("Coalesced Joins:   {}\n", snapshot.coalesced_joins));
    output.push_str(&format!("Transport Calls:   {}\n", snapshot.transport_calls));
    output.push_str(&format!("Throttled:         {}\n", snapshot.throttled));
    output.push_str(&format!("Transient Retries: {}\n", snapshot.transient_retries));
    output.push_str(&format!("Failures:          {}\n", snapshot.failures));
    output
}
