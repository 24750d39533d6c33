//! Semaphore-based concurrency gate for worker runs.
//!
//! The [`ConcurrencyGate`] limits the number of worker agents running at
//! once. Permits are handed out FIFO by a Tokio semaphore; dropping a
//! [`GatePermit`] frees its slot.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

/// Default number of concurrent worker runs.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// A permit granting the right to run one worker.
///
/// When dropped, the slot is returned to the gate.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Return the slot now. Same as dropping the permit.
    pub fn release(self) {
        drop(self);
    }
}

/// Bounded FIFO semaphore over runner slots.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGate {
    /// Create a gate with `capacity` slots; 0 means the default.
    pub fn new(capacity: usize) -> Self {
        let limit = if capacity == 0 {
            DEFAULT_CONCURRENCY
        } else {
            capacity
        };

        info!(capacity = limit, "Concurrency gate created");

        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            capacity: limit,
        }
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(GatePermit { _permit: permit })
    }

    /// Wait for a slot. Waiters are served in arrival order.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;
        Ok(GatePermit { _permit: permit })
    }

    /// Close the gate: pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Total number of slots.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

/// Errors from the concurrency gate.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The gate was closed (orchestrator shutting down).
    #[error("Concurrency gate has been closed")]
    Closed,
}
