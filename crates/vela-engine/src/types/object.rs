//! Object layout views
//!
//! Every managed object starts with one word holding its MethodTable
//! address. Arrays put their length at offset 8 and elements at 16.
//! Multi-dimensional arrays put `(total_length, rank, bounds[r],
//! lobounds[r])` words after the MT word, data after that. Strings are
//! `(MT, length: u32, pad: u32, utf16 chars)` with chars at 16 so element
//! addressing matches arrays.

use crate::types::MethodTablePtr;
use std::ptr::NonNull;

/// Size of the object header (the MT word).
pub const OBJECT_HEADER_SIZE: usize = 8;
/// Byte offset of an array's length word.
pub const ARRAY_LENGTH_OFFSET: usize = 8;
/// Byte offset of an array's first element.
pub const ARRAY_DATA_OFFSET: usize = 16;

/// A non-null reference to a managed object.
///
/// The accessors trust the object layout; they are safe to call only on
/// pointers produced by the runtime's allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef(NonNull<u8>);

unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Wrap a raw object address; `None` for null.
    #[inline]
    pub fn from_addr(addr: u64) -> Option<Self> {
        NonNull::new(addr as *mut u8).map(Self)
    }

    /// Wrap a payload pointer handed out by the GC heap.
    #[inline]
    pub fn from_payload(p: NonNull<u8>) -> Self {
        Self(p)
    }

    /// The object address.
    #[inline]
    pub fn addr(self) -> u64 {
        self.0.as_ptr() as u64
    }

    /// The object's MethodTable, read from the header word.
    #[inline]
    pub fn method_table(self) -> Option<MethodTablePtr> {
        unsafe {
            let mt = (self.0.as_ptr() as *const u64).read();
            MethodTablePtr::from_addr(mt)
        }
    }

    /// Install the MethodTable word.
    #[inline]
    pub fn set_method_table(self, mt: MethodTablePtr) {
        unsafe { (self.0.as_ptr() as *mut u64).write(mt.addr()) }
    }

    /// Array length (offset 8). Also the character count of strings and the
    /// total length of multi-dimensional arrays.
    #[inline]
    pub fn array_len(self) -> u64 {
        unsafe { (self.0.as_ptr().add(ARRAY_LENGTH_OFFSET) as *const u64).read() }
    }

    /// Set the array length word.
    #[inline]
    pub fn set_array_len(self, len: u64) {
        unsafe { (self.0.as_ptr().add(ARRAY_LENGTH_OFFSET) as *mut u64).write(len) }
    }

    /// Address of element `i` given the element size.
    #[inline]
    pub fn element_addr(self, i: u64, component_size: u16) -> u64 {
        self.addr() + ARRAY_DATA_OFFSET as u64 + i * component_size as u64
    }

    /// Read a word at a byte offset. Test and GC plumbing.
    #[inline]
    pub fn read_word(self, offset: usize) -> u64 {
        unsafe { (self.0.as_ptr().add(offset) as *const u64).read() }
    }

    /// Write a word at a byte offset. Test and GC plumbing.
    #[inline]
    pub fn write_word(self, offset: usize, value: u64) {
        unsafe { (self.0.as_ptr().add(offset) as *mut u64).write(value) }
    }
}

/// Word layout of a rank-`r` multi-dimensional array before the data:
/// `[MT][total][rank][bounds_0..r-1][lobounds_0..r-1]`.
#[inline]
pub fn md_array_data_offset(rank: u64) -> u64 {
    (3 + 2 * rank) * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MethodTableBuilder;

    #[test]
    fn test_header_roundtrip() {
        let mt = MethodTableBuilder::class(24).build();
        let mut storage = [0u64; 4];
        let obj = ObjectRef::from_addr(storage.as_mut_ptr() as u64).unwrap();
        obj.set_method_table(mt);
        assert_eq!(obj.method_table(), Some(mt));
        assert_eq!(storage[0], mt.addr());
    }

    #[test]
    fn test_array_fields() {
        let mut storage = [0u64; 8];
        let obj = ObjectRef::from_addr(storage.as_mut_ptr() as u64).unwrap();
        obj.set_array_len(5);
        assert_eq!(obj.array_len(), 5);
        assert_eq!(
            obj.element_addr(2, 4),
            obj.addr() + ARRAY_DATA_OFFSET as u64 + 8
        );
    }

    #[test]
    fn test_md_array_layout() {
        assert_eq!(md_array_data_offset(2), 56);
        assert_eq!(md_array_data_offset(3), 72);
    }
}
