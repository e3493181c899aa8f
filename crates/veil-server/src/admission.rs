//! Session admission: bounded concurrency plus live counters.
//!
//! [`AdmissionController`] owns a counting semaphore sized to the configured
//! session limit and an atomic active-session counter. Acquiring a slot
//! returns an [`AdmissionGuard`]; dropping the guard is the only way to give
//! the slot back, so release happens exactly once on every exit path.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use veil_core::{VeilError, VeilResult};

/// Runtime gate in front of the relay phase.
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    capacity: usize,
    /// Sessions currently holding a slot.
    active: Arc<AtomicUsize>,
    /// Sessions admitted since start.
    total: AtomicU64,
}

impl AdmissionController {
    /// Create a controller with `capacity` concurrent slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
            total: AtomicU64::new(0),
        }
    }

    /// Wait for a free slot, then count the session as active.
    ///
    /// Waiters queue in FIFO order; there is no overflow error.
    pub async fn acquire(&self) -> VeilResult<AdmissionGuard> {
        if self.available() == 0 {
            debug!(capacity = self.capacity, "all slots busy, session queued");
        }
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VeilError::Other("admission pool closed".into()))?;
        self.active.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(AdmissionGuard {
            _permit: permit,
            active: self.active.clone(),
        })
    }

    /// Sessions currently in their relay phase.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Configured slot count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sessions admitted since start.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Held for the lifetime of an admitted session. Owns its permit and a
/// handle to the counter so it can be moved into spawned tasks.
pub struct AdmissionGuard {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl AdmissionGuard {
    /// Give the slot back now instead of at end of scope.
    pub fn release(self) {}
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        // Saturating so a stray extra decrement can never wrap.
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}
