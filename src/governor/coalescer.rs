//! Single-flight execution per cache key.
//!
//! The first caller for a key spawns the work onto the runtime and publishes
//! a shared handle to its outcome; later callers for the same key await that
//! handle instead of starting their own call. The entry is removed by the
//! task itself once the work settles, so an abandoned caller never leaves a
//! stuck key, and the work runs to completion even if every caller stops
//! waiting.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::{GovernorError, GovernorResult};

type SharedOutcome<T> = Shared<BoxFuture<'static, GovernorResult<T>>>;

struct InFlightEntry<T: Clone> {
    id: u64,
    outcome: SharedOutcome<T>,
}

struct Entries<T: Clone> {
    next_id: u64,
    by_key: HashMap<String, InFlightEntry<T>>,
}

/// Map from key to the outcome of the one call currently running for it.
pub struct InFlightCoalescer<T: Clone> {
    entries: Arc<Mutex<Entries<T>>>,
}

impl<T: Clone> fmt::Debug for InFlightCoalescer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightCoalescer")
            .field("in_flight", &lock_entries(&self.entries).by_key.len())
            .finish()
    }
}

impl<T: Clone> Clone for InFlightCoalescer<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for InFlightCoalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> InFlightCoalescer<T> {
    /// Create an empty coalescer.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_id: 0,
                by_key: HashMap::new(),
            })),
        }
    }

    /// Run `work` unless a call for `key` is already in flight, in which case
    /// wait for that call and return its outcome.
    ///
    /// Returns the outcome and whether this caller joined an existing call.
    pub async fn run_exclusive<F, Fut>(&self, key: &str, work: F) -> (GovernorResult<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GovernorResult<T>> + Send + 'static,
    {
        let (outcome, joined) = {
            let mut entries = lock_entries(&self.entries);
            if let Some(entry) = entries.by_key.get(key) {
                debug!(key, "joining in-flight request");
                (entry.outcome.clone(), true)
            } else {
                let id = entries.next_id;
                entries.next_id += 1;
                let outcome = self.spawn_work(key.to_string(), id, work());
                entries.by_key.insert(
                    key.to_string(),
                    InFlightEntry {
                        id,
                        outcome: outcome.clone(),
                    },
                );
                (outcome, false)
            }
        };

        (outcome.await, joined)
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        lock_entries(&self.entries).by_key.len()
    }

    /// Whether a call for `key` is in flight.
    pub fn contains(&self, key: &str) -> bool {
        lock_entries(&self.entries).by_key.contains_key(key)
    }

    fn spawn_work<Fut>(&self, key: String, id: u64, work: Fut) -> SharedOutcome<T>
    where
        Fut: Future<Output = GovernorResult<T>> + Send + 'static,
    {
        let entries = Arc::clone(&self.entries);
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(GovernorError::Worker("in-flight work panicked".to_string()))
                });
            let mut entries = lock_entries(&entries);
            if entries.by_key.get(&key).map_or(false, |entry| entry.id == id) {
                entries.by_key.remove(&key);
            }
            outcome
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(err) => Err(GovernorError::Worker(err.to_string())),
            }
        }
        .boxed()
        .shared()
    }
}

fn lock_entries<T: Clone>(entries: &Mutex<Entries<T>>) -> MutexGuard<'_, Entries<T>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}
