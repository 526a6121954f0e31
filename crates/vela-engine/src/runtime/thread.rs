//! Mutator thread registration and managed↔runtime transition frames
//!
//! Every thread that runs managed code registers itself here. When managed
//! code calls into the runtime (allocation, interface resolution, leave
//! processing), the transition stub publishes a transition frame (the
//! `(rip, rsp, rbp)` of the managed call site) before the Rust helper
//! runs. The GC stack walk for a thread starts at its newest transition
//! frame and, when unwinding runs off the end of a managed segment, falls
//! back to the next older one. That makes managed→native→managed
//! sandwiches walkable without native unwind tables.

use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use vela_unwind::Context;

/// One managed→runtime crossing.
#[derive(Debug, Clone, Copy)]
pub struct TransitionFrame {
    /// Return address into managed code.
    pub rip: u64,
    /// Managed caller's stack pointer after return.
    pub rsp: u64,
    /// Managed caller's frame pointer.
    pub rbp: u64,
}

/// Exception-dispatch state parked on the thread between passes and across
/// `rethrow`.
#[derive(Debug, Clone)]
pub struct ActiveDispatch {
    /// The exception object.
    pub exception: u64,
    /// Context at the original raise site.
    pub throw_ctx: Context,
    /// Frame pointer of the frame whose clause matched.
    pub handler_frame: u64,
    /// Index of the matched clause within that frame's table.
    pub handler_clause: usize,
}

/// Per-thread runtime state.
pub struct MutatorThread {
    id: u64,
    /// Transition frames, oldest first. Pushed/popped by the owning thread;
    /// read by the collector while the world is stopped.
    transitions: Mutex<Vec<TransitionFrame>>,
    /// Depth of runtime entries (>= transitions.len(); kept separately so
    /// the collector can make the stopped-or-pinned decision with one load).
    in_runtime: AtomicUsize,
    /// The exception being dispatched or handled, if any.
    current_exception: AtomicU64,
    /// Dispatch state for `rethrow` and continuation resume.
    active_dispatch: Mutex<Option<ActiveDispatch>>,
}

impl MutatorThread {
    /// Thread id (runtime-assigned, not the OS id).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Push a transition frame. Called on runtime entry.
    pub fn push_transition(&self, frame: TransitionFrame) {
        self.transitions.lock().push(frame);
        self.in_runtime.fetch_add(1, Ordering::Release);
    }

    /// Pop the newest transition frame. Called on runtime exit.
    pub fn pop_transition(&self) {
        self.in_runtime.fetch_sub(1, Ordering::Release);
        self.transitions.lock().pop();
    }

    /// Snapshot of the transition stack, newest last.
    pub fn transitions(&self) -> Vec<TransitionFrame> {
        self.transitions.lock().clone()
    }

    /// Whether the thread is currently inside the runtime (its managed
    /// stack is pinned by a transition frame).
    pub fn in_runtime(&self) -> bool {
        self.in_runtime.load(Ordering::Acquire) > 0
    }

    /// Drop transition frames whose managed stack is below (deeper than)
    /// `rsp_limit`. Used when exception dispatch abandons stack segments.
    /// Returns how many frames were dropped so the caller can release the
    /// world shares those runtime entries held.
    pub fn prune_transitions_below(&self, rsp_limit: u64) -> usize {
        let mut t = self.transitions.lock();
        let before = t.len();
        t.retain(|f| f.rsp > rsp_limit);
        let removed = before - t.len();
        if removed > 0 {
            self.in_runtime.fetch_sub(removed, Ordering::Release);
        }
        removed
    }

    /// Current runtime-entry depth.
    pub fn transition_depth(&self) -> usize {
        self.in_runtime.load(Ordering::Acquire)
    }

    /// The exception currently in flight (0 when none).
    pub fn current_exception(&self) -> u64 {
        self.current_exception.load(Ordering::Acquire)
    }

    /// Set the in-flight exception.
    pub fn set_current_exception(&self, obj: u64) {
        self.current_exception.store(obj, Ordering::Release);
    }

    /// Replace the active dispatch record.
    pub fn set_active_dispatch(&self, d: Option<ActiveDispatch>) {
        *self.active_dispatch.lock() = d;
    }

    /// Clone the active dispatch record.
    pub fn active_dispatch(&self) -> Option<ActiveDispatch> {
        self.active_dispatch.lock().clone()
    }
}

/// All registered mutator threads.
pub struct ThreadRegistry {
    threads: RwLock<Vec<Arc<MutatorThread>>>,
    next_id: AtomicU64,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<MutatorThread>>> = const { RefCell::new(None) };
}

impl ThreadRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register the calling thread as a mutator (idempotent) and return its
    /// state.
    pub fn register_current(&self) -> Arc<MutatorThread> {
        if let Some(t) = Self::current() {
            return t;
        }
        let t = Arc::new(MutatorThread {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            transitions: Mutex::new(Vec::new()),
            in_runtime: AtomicUsize::new(0),
            current_exception: AtomicU64::new(0),
            active_dispatch: Mutex::new(None),
        });
        self.threads.write().push(t.clone());
        CURRENT.with(|c| *c.borrow_mut() = Some(t.clone()));
        t
    }

    /// The calling thread's state, when registered.
    pub fn current() -> Option<Arc<MutatorThread>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Remove the calling thread from the registry.
    pub fn unregister_current(&self) {
        if let Some(t) = Self::current() {
            self.threads.write().retain(|x| x.id != t.id);
            CURRENT.with(|c| *c.borrow_mut() = None);
        }
    }

    /// Snapshot of all registered threads.
    pub fn threads(&self) -> Vec<Arc<MutatorThread>> {
        self.threads.read().clone()
    }

    /// Number of registered threads.
    pub fn count(&self) -> usize {
        self.threads.read().len()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let reg = ThreadRegistry::new();
        let a = reg.register_current();
        let b = reg.register_current();
        assert_eq!(a.id(), b.id());
        assert_eq!(reg.count(), 1);
        reg.unregister_current();
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn test_transition_stack() {
        let reg = ThreadRegistry::new();
        let t = reg.register_current();
        assert!(!t.in_runtime());

        t.push_transition(TransitionFrame {
            rip: 1,
            rsp: 0x9000,
            rbp: 0x9100,
        });
        t.push_transition(TransitionFrame {
            rip: 2,
            rsp: 0x8000,
            rbp: 0x8100,
        });
        assert!(t.in_runtime());
        assert_eq!(t.transitions().len(), 2);

        t.prune_transitions_below(0x8800);
        let left = t.transitions();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].rip, 1);

        t.pop_transition();
        assert!(!t.in_runtime());
        reg.unregister_current();
    }

    #[test]
    fn test_threads_register_from_multiple_threads() {
        let reg = Arc::new(ThreadRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    let t = reg.register_current();
                    let id = t.id();
                    reg.unregister_current();
                    id
                })
            })
            .collect();
        let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert_eq!(reg.count(), 0);
    }
}
