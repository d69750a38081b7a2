//! Spare CPU/RAM accounting.
//!
//! The tracker never refuses a reservation. The poller checks a snapshot
//! before asking for more work; that check is the only back-pressure.

use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityState {
    pub cpu: i64,
    pub ram: i64,
}

impl CapacityState {
    /// True when either dimension is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.cpu <= 0 || self.ram <= 0
    }
}

#[derive(Debug, Clone)]
pub struct CapacityTracker {
    state: Arc<Mutex<CapacityState>>,
}

impl CapacityTracker {
    pub fn new(cpu: i64, ram: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(CapacityState { cpu, ram })),
        }
    }

    /// Unconditionally take `cpu`/`ram` out of the budget. May go negative.
    pub fn reserve(&self, cpu: i64, ram: i64) {
        let mut state = self.lock();
        state.cpu -= cpu;
        state.ram -= ram;
    }

    pub fn release(&self, cpu: i64, ram: i64) {
        let mut state = self.lock();
        state.cpu += cpu;
        state.ram += ram;
    }

    pub fn snapshot(&self) -> CapacityState {
        *self.lock()
    }

    /// Reserve and hand back a guard that releases the same amounts
    /// exactly once, either explicitly or on drop.
    pub fn acquire(&self, cpu: i64, ram: i64) -> Reservation {
        self.reserve(cpu, ram);
        Reservation {
            tracker: self.clone(),
            cpu,
            ram,
            released: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CapacityState> {
        // Counters stay consistent even if a holder panicked: every
        // critical section is a pair of integer additions.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Capacity held by one job.
#[derive(Debug)]
pub struct Reservation {
    tracker: CapacityTracker,
    cpu: i64,
    ram: i64,
    released: bool,
}

impl Reservation {
    pub fn cpu(&self) -> i64 {
        self.cpu
    }

    pub fn ram(&self) -> i64 {
        self.ram
    }

    /// Give the capacity back. Later calls and the eventual drop are no-ops.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.tracker.release(self.cpu, self.ram);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}
