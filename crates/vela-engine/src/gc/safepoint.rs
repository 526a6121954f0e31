//! Safepoint coordination for stop-the-world pauses
//!
//! Mutator threads register themselves and either poll at safepoints or run
//! inside the runtime with a published transition frame. A collector asks
//! for the world to stop; a mutator counts as stopped while it is parked in
//! [`SafepointCoordinator::poll`] or while its thread state says it is
//! inside the runtime (the transition frame pins its managed stack).
//!
//! The fast path of `poll` is a single relaxed load.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Why the world is being stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Garbage collection.
    GarbageCollection,
    /// Something else (tests, diagnostics).
    Inspection,
}

/// Coordinates stop-the-world pauses across mutator threads.
pub struct SafepointCoordinator {
    /// A stop is pending; mutators must park.
    stop_pending: AtomicBool,
    /// Mutators currently parked in `poll`.
    parked: AtomicUsize,
    lock: Mutex<()>,
    /// Signaled when `parked` changes or the stop ends.
    cond: Condvar,
}

impl SafepointCoordinator {
    /// A coordinator with no stop pending.
    pub fn new() -> Self {
        Self {
            stop_pending: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Whether a stop has been requested.
    #[inline]
    pub fn stop_pending(&self) -> bool {
        self.stop_pending.load(Ordering::Acquire)
    }

    /// Mutator-side safepoint. Returns immediately when no stop is pending;
    /// otherwise parks until the collector resumes the world.
    pub fn poll(&self) {
        if !self.stop_pending() {
            return;
        }
        let mut guard = self.lock.lock();
        if !self.stop_pending() {
            return;
        }
        self.parked.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_all();
        while self.stop_pending() {
            self.cond.wait(&mut guard);
        }
        self.parked.fetch_sub(1, Ordering::AcqRel);
        self.cond.notify_all();
    }

    /// Collector-side: flag the stop. Mutators park at their next poll.
    pub fn begin_stop(&self, reason: StopReason) {
        log::debug!("requesting stop-the-world: {reason:?}");
        self.stop_pending.store(true, Ordering::Release);
    }

    /// Collector-side: request a stop and wait until `expected_parked`
    /// mutators are parked (callers subtract threads already pinned inside
    /// the runtime and the collecting thread itself).
    pub fn request_stop(&self, reason: StopReason, expected_parked: usize) {
        self.begin_stop(reason);
        let mut guard = self.lock.lock();
        while self.parked.load(Ordering::Acquire) < expected_parked {
            self.cond.wait(&mut guard);
        }
    }

    /// Collector-side: release the world.
    pub fn resume_all(&self) {
        let _guard = self.lock.lock();
        self.stop_pending.store(false, Ordering::Release);
        self.cond.notify_all();
    }

    /// Mutators currently parked.
    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
