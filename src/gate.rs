//! Process-wide admission gate bounding in-flight requests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::{FetchError, Result};

#[derive(Debug)]
struct GateState {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Counting admission gate.
///
/// Acquirers beyond the capacity are suspended and admitted in arrival
/// order (the underlying `tokio` semaphore is fair). Cloning shares the gate.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    state: Arc<GateState>,
}

/// Slot held for one logical request. Dropping it releases the slot.
#[derive(Debug)]
pub struct Permit {
    state: Arc<GateState>,
    _slot: OwnedSemaphorePermit,
}

impl Drop for Permit {
    fn drop(&mut self) {
        // Runs before `_slot` returns the semaphore slot, so the counter
        // never exceeds the capacity.
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    /// Creates a gate with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Arc::new(GateState {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Waits for a free slot.
    ///
    /// Fails with [`FetchError::Disabled`] once the gate is closed, including
    /// for callers that were already waiting.
    pub async fn acquire(&self) -> Result<Permit> {
        let slot = Arc::clone(&self.state.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Disabled)?;
        Ok(self.admit(slot))
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Result<Option<Permit>> {
        match Arc::clone(&self.state.semaphore).try_acquire_owned() {
            Ok(slot) => Ok(Some(self.admit(slot))),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(FetchError::Disabled),
        }
    }

    fn admit(&self, slot: OwnedSemaphorePermit) -> Permit {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(now, Ordering::SeqCst);
        Permit {
            state: Arc::clone(&self.state),
            _slot: slot,
        }
    }

    /// Refuses new acquisitions and wakes every waiter with an error.
    /// Permits already handed out stay valid until dropped.
    pub fn close(&self) {
        self.state.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of permits ever held at once.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}
