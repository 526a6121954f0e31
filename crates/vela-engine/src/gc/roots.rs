//! Root sources: static regions and the per-method GCInfo index

use parking_lot::RwLock;
use std::ffi::c_void;
use std::sync::Arc;

/// Visitor callback for root enumeration. Receives the address of a slot
/// that may hold a GC reference, plus the opaque context it was registered
/// with. Kept as a bare function pointer so it can cross into runtime code
/// that carries no closures.
pub type RootVisitor = unsafe fn(ctx: *mut c_void, slot: *mut u64);

/// Registered static root regions: `(first slot address, slot count)`.
///
/// Append-only after startup; enumeration takes the read side only.
pub struct StaticRootRegistry {
    regions: RwLock<Vec<(u64, usize)>>,
}

impl StaticRootRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(Vec::new()),
        }
    }

    /// Register a region of `count` pointer-sized slots starting at `addr`.
    /// The region must stay valid for the life of the process.
    pub fn register(&self, addr: u64, count: usize) {
        self.regions.write().push((addr, count));
    }

    /// Call `visit` for every slot of every region.
    pub fn enumerate(&self, ctx: *mut c_void, visit: RootVisitor) {
        let regions = self.regions.read();
        for &(addr, count) in regions.iter() {
            for i in 0..count {
                unsafe { visit(ctx, (addr + 8 * i as u64) as *mut u64) };
            }
        }
    }

    /// Number of registered regions.
    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }
}

impl Default for StaticRootRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Code-range → GCInfo blob index, used by the stack walker to find the
/// metadata for a frame's RIP. Append-only; reads are lock-shared.
pub struct GcInfoIndex {
    entries: RwLock<Vec<(u64, u64, Arc<Vec<u8>>)>>,
}

impl GcInfoIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register `blob` for code in `[begin, end)`.
    pub fn register(&self, begin: u64, end: u64, blob: Arc<Vec<u8>>) {
        let mut entries = self.entries.write();
        entries.push((begin, end, blob));
        entries.sort_by_key(|&(b, _, _)| b);
    }

    /// Find the blob covering `rip` and the code-range begin address.
    pub fn lookup(&self, rip: u64) -> Option<(u64, Arc<Vec<u8>>)> {
        let entries = self.entries.read();
        let idx = entries.partition_point(|&(b, _, _)| b <= rip);
        if idx == 0 {
            return None;
        }
        let (begin, end, ref blob) = entries[idx - 1];
        if rip < end {
            Some((begin, blob.clone()))
        } else {
            None
        }
    }
}

impl Default for GcInfoIndex {
    fn default() -> Self {
        Self::new()
    }
}
