//! Vela runtime core
//!
//! This crate hosts the three load-bearing subsystems of the runtime:
//! - **JIT**: a streaming IL → x86-64 compiler with funclet-based exception
//!   regions and per-call-site GC info (`jit` module)
//! - **Exception dispatch**: two-pass search-and-unwind over the
//!   Windows-x64 style tables in `vela-unwind` (`eh` module)
//! - **GC**: a stop-the-world mark/sweep collector over a bump + free-list
//!   heap, rooted from static regions and unwound mutator stacks (`gc`,
//!   `heap` modules)
//!
//! `runtime::Runtime` wires them together in the required order (code heap →
//! GC heap → unwind registry → method registry → JIT) and owns the
//! process-wide registries.
//!
//! The crate targets x86-64 only; emitted code follows the Windows-x64
//! calling convention, so host code calls JIT entrypoints through
//! `extern "win64"` function pointers.

#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]

pub mod eh;
pub mod gc;
pub mod heap;
pub mod jit;
pub mod runtime;
pub mod types;

pub use runtime::{runtime, Runtime};

#[cfg(test)]
pub(crate) mod test_sync {
    //! Unit tests that register the calling thread as a mutator (directly
    //! or by running emitted code) serialize on this lock and unregister
    //! before returning, so a concurrent `collect()` never waits on a
    //! thread that no longer polls.
    use once_cell::sync::Lazy;
    use parking_lot::{Mutex, MutexGuard};

    static LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    pub fn serial() -> MutexGuard<'static, ()> {
        LOCK.lock()
    }
}
