//! Structured exception handling: clause tables and two-pass dispatch

pub mod dispatch;

pub use dispatch::{
    parse_clause_table, raise_from_runtime, write_clause_table, NativeEhClause, CLAUSE_FAULT,
    CLAUSE_FILTER, CLAUSE_FINALLY, CLAUSE_TYPED,
};
