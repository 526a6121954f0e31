//! Windows-x64 compatible unwind tables and unwinder
//!
//! This crate owns the three pieces the rest of the runtime builds on:
//! - the bit-exact `RUNTIME_FUNCTION` / `UNWIND_INFO` wire formats
//!   ([`format`]), including a builder the JIT uses to describe its prologs
//! - the per-process function-table registry keyed by RIP range ([`registry`])
//! - the unwinder that replays unwind codes to roll a register context back
//!   to its caller ([`unwinder`])
//!
//! Both exception dispatch and GC stack walks drive [`unwinder::unwind_one`];
//! neither knows more about frames than these tables describe.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod context;
pub mod format;
pub mod registry;
pub mod unwinder;

pub use context::Context;
pub use format::{RuntimeFunction, UnwindCode, UnwindFlags, UnwindInfo};
pub use registry::{FunctionTableRegistry, TableId};
pub use unwinder::{unwind_one, StepResult};

use thiserror::Error;

/// Errors surfaced by unwind-info parsing and the unwinder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnwindError {
    /// The UNWIND_INFO blob was shorter than its own header claims.
    #[error("truncated UNWIND_INFO")]
    Truncated,

    /// The version field was not 1.
    #[error("unsupported UNWIND_INFO version {0}")]
    BadVersion(u8),

    /// An unwind-code slot carried an operation this unwinder does not know.
    #[error("unsupported unwind opcode {0}")]
    BadOpcode(u8),

    /// Chained unwind info is not part of the supported surface.
    #[error("chained UNWIND_INFO is not supported")]
    ChainedInfo,

    /// The RIP being unwound is not covered by any registered table.
    #[error("no function entry covers rip {0:#x}")]
    UnregisteredRip(u64),

    /// A builder was asked to encode a value outside the format's range.
    #[error("unencodable unwind value: {0}")]
    Unencodable(&'static str),
}
