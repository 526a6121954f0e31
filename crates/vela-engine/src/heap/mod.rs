//! Memory providers: executable code pages and the managed object heap

pub mod code_heap;
pub mod gc_heap;

pub use code_heap::{CodeHeap, RawCodePtr};
pub use gc_heap::{GcHeap, BLOCK_HEADER_SIZE};
