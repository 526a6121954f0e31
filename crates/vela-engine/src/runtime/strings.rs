//! String literals: interning table and string objects
//!
//! `ldstr` resolves at JIT time through this table; a token with no
//! registered literal loads null, preserving the stub behavior when the
//! surrounding library layer registers nothing. Interned objects live in
//! the GC heap and are kept alive by a fixed slot region registered as a
//! static root.

use crate::heap::GcHeap;
use crate::types::{MethodTablePtr, ObjectRef, ARRAY_DATA_OFFSET};
use dashmap::DashMap;
use parking_lot::Mutex;

/// Capacity of the literal root region.
const MAX_LITERALS: usize = 1024;

/// The interning table.
pub struct StringLiteralTable {
    /// token → index into the root region.
    map: DashMap<u32, usize>,
    /// Fixed root region holding every interned string. Registered with
    /// the static-root registry at runtime init.
    slots: Box<[u64; MAX_LITERALS]>,
    next: Mutex<usize>,
}

impl StringLiteralTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
            slots: Box::new([0; MAX_LITERALS]),
            next: Mutex::new(0),
        }
    }

    /// Address and length of the root region, for registration.
    pub fn root_region(&self) -> (u64, usize) {
        (self.slots.as_ptr() as u64, MAX_LITERALS)
    }

    /// Allocate a string object: `[MT][char count][utf16 data]` with data
    /// at offset 16. Returns `None` on heap exhaustion.
    pub fn alloc_string(heap: &GcHeap, string_mt: MethodTablePtr, text: &str) -> Option<ObjectRef> {
        let units: Vec<u16> = text.encode_utf16().collect();
        let size = ARRAY_DATA_OFFSET + 2 * units.len();
        let p = heap.alloc(size)?;
        let obj = ObjectRef::from_payload(p);
        obj.set_method_table(string_mt);
        obj.set_array_len(units.len() as u64);
        unsafe {
            let data = p.as_ptr().add(ARRAY_DATA_OFFSET) as *mut u16;
            for (i, &u) in units.iter().enumerate() {
                data.add(i).write(u);
            }
        }
        Some(obj)
    }

    /// Read a string object back into a Rust `String` (tests, diagnostics).
    pub fn read_string(obj: ObjectRef) -> String {
        let len = obj.array_len() as usize;
        let data =
            unsafe { core::slice::from_raw_parts((obj.addr() as usize + ARRAY_DATA_OFFSET) as *const u16, len) };
        String::from_utf16_lossy(data)
    }

    /// Intern `text` under `token`. Re-interning a token returns the
    /// existing object. Returns `None` when the heap or the root region is
    /// exhausted.
    pub fn intern(
        &self,
        heap: &GcHeap,
        string_mt: MethodTablePtr,
        token: u32,
        text: &str,
    ) -> Option<ObjectRef> {
        if let Some(idx) = self.map.get(&token) {
            return ObjectRef::from_addr(self.slots[*idx]);
        }
        let obj = Self::alloc_string(heap, string_mt, text)?;
        let mut next = self.next.lock();
        if *next >= MAX_LITERALS {
            log::warn!("string literal table full; ldstr token {token:#x} unresolved");
            return None;
        }
        let idx = *next;
        *next += 1;
        // The slot array is append-only; publishing the address after the
        // write keeps readers consistent without a lock.
        unsafe {
            (self.slots.as_ptr() as *mut u64).add(idx).write(obj.addr());
        }
        self.map.insert(token, idx);
        Some(obj)
    }

    /// Resolve a token to an interned object address; `None` when nothing
    /// was registered (the JIT then loads null).
    pub fn resolve(&self, token: u32) -> Option<u64> {
        self.map.get(&token).map(|idx| self.slots[*idx])
    }
}

impl Default for StringLiteralTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MethodTableBuilder;

    fn string_mt() -> MethodTablePtr {
        MethodTableBuilder::class(16).string().build()
    }

    #[test]
    fn test_alloc_and_read_back() {
        let heap = GcHeap::new(0x10000).unwrap();
        let mt = string_mt();
        let s = StringLiteralTable::alloc_string(&heap, mt, "hello Δ").unwrap();
        assert_eq!(s.array_len(), 7);
        assert_eq!(StringLiteralTable::read_string(s), "hello Δ");
        assert_eq!(s.method_table(), Some(mt));
    }

    #[test]
    fn test_intern_dedups_by_token() {
        let heap = GcHeap::new(0x10000).unwrap();
        let mt = string_mt();
        let table = StringLiteralTable::new();

        assert!(table.resolve(7).is_none());
        let a = table.intern(&heap, mt, 7, "seven").unwrap();
        let b = table.intern(&heap, mt, 7, "seven").unwrap();
        assert_eq!(a.addr(), b.addr());
        assert_eq!(table.resolve(7), Some(a.addr()));

        let c = table.intern(&heap, mt, 8, "eight").unwrap();
        assert_ne!(a.addr(), c.addr());
    }

    #[test]
    fn test_root_region_covers_interned() {
        let heap = GcHeap::new(0x10000).unwrap();
        let mt = string_mt();
        let table = StringLiteralTable::new();
        let s = table.intern(&heap, mt, 1, "rooted").unwrap();

        let (addr, count) = table.root_region();
        let slots = unsafe { core::slice::from_raw_parts(addr as *const u64, count) };
        assert!(slots.contains(&s.addr()));
    }
}
