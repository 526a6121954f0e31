//! IL bytecode definitions and method-body parsing for the Vela runtime
//!
//! This crate is the front door of the JIT: it knows the instruction set,
//! the tiny/fat method header formats, and the exception-handling clause
//! tables that ride behind fat method bodies. It deliberately knows nothing
//! about code generation; the engine crate consumes the parsed form.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cursor;
pub mod method;
pub mod opcode;

pub use cursor::IlCursor;
pub use method::{EhClause, EhClauseKind, MethodBody, MethodSig, ReturnKind};
pub use opcode::{ExtOpcode, Opcode};

use thiserror::Error;

/// Errors produced while decoding IL method bodies or instruction streams.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IlError {
    /// The stream ended before a complete value could be read.
    #[error("truncated IL stream at offset {0}")]
    Truncated(usize),

    /// Byte 0 of the method body carried an unknown format tag.
    #[error("unrecognized method header kind {0:#04x}")]
    BadHeaderKind(u8),

    /// A `MoreSects` section had an unknown kind byte.
    #[error("unrecognized method data section kind {0:#04x}")]
    BadSectionKind(u8),

    /// An EH clause carried a flags word that maps to no clause kind.
    #[error("unrecognized EH clause flags {0:#010x}")]
    BadClauseKind(u32),

    /// A one-byte opcode that is not part of the instruction set.
    #[error("unknown opcode {0:#04x} at IL offset {1}")]
    UnknownOpcode(u8, usize),

    /// A two-byte (0xFE-prefixed) opcode that is not part of the set.
    #[error("unknown extended opcode 0xfe {0:#04x} at IL offset {1}")]
    UnknownExtOpcode(u8, usize),
}
