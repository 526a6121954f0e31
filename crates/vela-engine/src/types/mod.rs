//! Runtime type model: MethodTables, object layout, assignability

pub mod method_table;
pub mod object;

pub use method_table::{
    is_assignable, MethodTableBuilder, MethodTableFlags, MethodTablePtr, MT_HEADER_SIZE,
    MT_VTABLE_OFFSET,
};
pub use object::{ObjectRef, ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, OBJECT_HEADER_SIZE};
