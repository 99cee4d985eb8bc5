//! Bounded concurrency per resource key.
//!
//! Each resource (the text-generation service, a web origin) gets its own
//! semaphore, created lazily with the limit configured for that key. The
//! semaphore is dropped again once its last permit is returned and nobody is
//! waiting, so a crawl over many origins does not keep one per origin.
//!
//! A closed resource rejects current waiters and every later acquire with
//! [`GovernorError::GateClosed`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::config::GateConfig;
use crate::error::{GovernorError, GovernorResult};

#[derive(Debug, Default)]
struct GateSlots {
    semaphores: HashMap<String, Arc<Semaphore>>,
    closed: HashSet<String>,
}

fn lock_slots(slots: &Mutex<GateSlots>) -> MutexGuard<'_, GateSlots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A held slot; the slot is returned when this is dropped or released.
#[derive(Debug)]
pub struct GatePermit {
    resource: String,
    permit: Option<OwnedSemaphorePermit>,
    slots: Arc<Mutex<GateSlots>>,
}

impl GatePermit {
    /// The resource this slot belongs to.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Return the slot explicitly.
    pub fn release(self) {}
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        drop(self.permit.take());

        let mut slots = lock_slots(&self.slots);
        // Only the map still holds the semaphore: no permits, no waiters.
        let idle = slots
            .semaphores
            .get(&self.resource)
            .map_or(false, |semaphore| Arc::strong_count(semaphore) == 1);
        if idle {
            slots.semaphores.remove(&self.resource);
        }
    }
}

/// Counting semaphores keyed by resource identity.
#[derive(Debug)]
pub struct ConcurrencyGate {
    config: GateConfig,
    slots: Arc<Mutex<GateSlots>>,
}

impl ConcurrencyGate {
    /// Create a gate with per-resource limits from `config`.
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            slots: Arc::new(Mutex::new(GateSlots::default())),
        }
    }

    /// Wait for a free slot on `resource`.
    pub async fn acquire(&self, resource: &str) -> GovernorResult<GatePermit> {
        let semaphore = self.semaphore(resource)?;
        if semaphore.available_permits() == 0 {
            debug!(resource, "waiting for concurrency slot");
        }
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| GovernorError::GateClosed(resource.to_string()))?;
        Ok(self.permit(resource, permit))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, resource: &str) -> Option<GatePermit> {
        let permit = self.semaphore(resource).ok()?.try_acquire_owned().ok()?;
        Some(self.permit(resource, permit))
    }

    /// Stop handing out slots for `resource`.
    ///
    /// Waiters fail with [`GovernorError::GateClosed`]; permits already held
    /// stay valid until dropped.
    pub fn close(&self, resource: &str) {
        let mut slots = lock_slots(&self.slots);
        if !slots.closed.insert(resource.to_string()) {
            return;
        }
        if let Some(semaphore) = slots.semaphores.remove(resource) {
            semaphore.close();
        }
        info!(resource, "concurrency gate closed");
    }

    /// Whether `resource` has been closed.
    pub fn is_closed(&self, resource: &str) -> bool {
        lock_slots(&self.slots).closed.contains(resource)
    }

    /// Free slots on `resource`.
    pub fn available(&self, resource: &str) -> usize {
        let slots = lock_slots(&self.slots);
        if slots.closed.contains(resource) {
            return 0;
        }
        slots
            .semaphores
            .get(resource)
            .map_or_else(|| self.limit(resource), |s| s.available_permits())
    }

    /// Configured ceiling for `resource`.
    pub fn limit(&self, resource: &str) -> usize {
        self.config.limit_for(resource)
    }

    /// Number of resources with a live semaphore.
    pub fn tracked(&self) -> usize {
        lock_slots(&self.slots).semaphores.len()
    }

    fn permit(&self, resource: &str, permit: OwnedSemaphorePermit) -> GatePermit {
        GatePermit {
            resource: resource.to_string(),
            permit: Some(permit),
            slots: Arc::clone(&self.slots),
        }
    }

    fn semaphore(&self, resource: &str) -> GovernorResult<Arc<Semaphore>> {
        let mut slots = lock_slots(&self.slots);
        if slots.closed.contains(resource) {
            return Err(GovernorError::GateClosed(resource.to_string()));
        }
        Ok(slots
            .semaphores
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.limit_for(resource))))
            .clone())
    }
}
