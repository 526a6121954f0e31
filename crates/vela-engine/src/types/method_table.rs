//! MethodTable: the runtime type descriptor
//!
//! A MethodTable is a raw C-layout structure because emitted code reads it
//! directly: `callvirt` loads vtable slots, `ldlen`/`newarr` read the
//! component size, the GC reads the flags. The unsafe reads are confined to
//! [`MethodTablePtr`]; everything else goes through its accessors.
//!
//! Layout:
//! ```text
//! +0   component_size: u16     element size for arrays/strings, else 0
//! +2   flags: u16
//! +4   base_size: u32          instance size including the MT word
//! +8   related_type: u64       element MT for arrays, base MT for classes
//! +16  num_vtable_slots: u16
//! +18  num_interfaces: u16
//! +20  hash_code: u32
//! +24  vtable slots            num_vtable_slots * 8 bytes
//! +..  interface map           num_interfaces * 16 bytes:
//!                              (interface MT: u64, start_slot: u32, pad)
//! ```

use bitflags::bitflags;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Size of the fixed MethodTable header.
pub const MT_HEADER_SIZE: usize = 24;
/// Offset of the first vtable slot.
pub const MT_VTABLE_OFFSET: usize = 24;

bitflags! {
    /// MethodTable flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodTableFlags: u16 {
        /// The type is a (single- or multi-dimensional) array.
        const IS_ARRAY = 0x0001;
        /// `component_size` is meaningful (arrays and strings).
        const HAS_COMPONENT_SIZE = 0x0002;
        /// Instances contain GC references the collector must trace.
        const HAS_POINTERS = 0x0004;
        /// The type is an interface.
        const IS_INTERFACE = 0x0008;
        /// The type is a value type; boxed payloads live after the MT word.
        const IS_VALUE_TYPE = 0x0010;
        /// The type is the string type.
        const IS_STRING = 0x0020;
    }
}

#[repr(C)]
struct RawHeader {
    component_size: u16,
    flags: u16,
    base_size: u32,
    related_type: u64,
    num_vtable_slots: u16,
    num_interfaces: u16,
    hash_code: u32,
}

#[repr(C)]
struct RawInterfaceEntry {
    interface_mt: u64,
    start_slot: u32,
    _pad: u32,
}

/// A pointer to a live MethodTable.
///
/// MethodTables are process-lifetime: the builder leaks its storage, so a
/// copy of this pointer never dangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodTablePtr(NonNull<u8>);

unsafe impl Send for MethodTablePtr {}
unsafe impl Sync for MethodTablePtr {}

impl MethodTablePtr {
    /// Rehydrate from an address stored in an object header.
    ///
    /// # Safety
    ///
    /// `addr` must be the address of a MethodTable built by
    /// [`MethodTableBuilder`] (or a bit-identical layout).
    #[inline]
    pub unsafe fn from_addr(addr: u64) -> Option<Self> {
        NonNull::new(addr as *mut u8).map(Self)
    }

    /// The raw address, as emitted code sees it.
    #[inline]
    pub fn addr(self) -> u64 {
        self.0.as_ptr() as u64
    }

    #[inline]
    fn header(self) -> &'static RawHeader {
        unsafe { &*(self.0.as_ptr() as *const RawHeader) }
    }

    /// Element size for arrays/strings; 0 for classes.
    #[inline]
    pub fn component_size(self) -> u16 {
        self.header().component_size
    }

    /// Flag bits.
    #[inline]
    pub fn flags(self) -> MethodTableFlags {
        MethodTableFlags::from_bits_truncate(self.header().flags)
    }

    /// Instance size including the MT word (meaningless for arrays).
    #[inline]
    pub fn base_size(self) -> u32 {
        self.header().base_size
    }

    /// Element type for arrays, base class for classes.
    #[inline]
    pub fn related_type(self) -> Option<MethodTablePtr> {
        unsafe { Self::from_addr(self.header().related_type) }
    }

    /// Number of vtable slots.
    #[inline]
    pub fn num_vtable_slots(self) -> u16 {
        self.header().num_vtable_slots
    }

    /// Number of interface-map entries.
    #[inline]
    pub fn num_interfaces(self) -> u16 {
        self.header().num_interfaces
    }

    /// Per-type hash code, assigned at build time.
    #[inline]
    pub fn hash_code(self) -> u32 {
        self.header().hash_code
    }

    /// Read vtable slot `i`.
    pub fn vtable_slot(self, i: u16) -> u64 {
        debug_assert!(i < self.num_vtable_slots());
        unsafe {
            let p = self.0.as_ptr().add(MT_VTABLE_OFFSET + 8 * i as usize) as *const u64;
            p.read()
        }
    }

    /// Overwrite vtable slot `i` (used while wiring types up).
    pub fn set_vtable_slot(self, i: u16, entry: u64) {
        debug_assert!(i < self.num_vtable_slots());
        unsafe {
            let p = self.0.as_ptr().add(MT_VTABLE_OFFSET + 8 * i as usize) as *mut u64;
            p.write(entry);
        }
    }

    fn interface_entry(self, i: u16) -> &'static RawInterfaceEntry {
        debug_assert!(i < self.num_interfaces());
        unsafe {
            let base = self
                .0
                .as_ptr()
                .add(MT_VTABLE_OFFSET + 8 * self.num_vtable_slots() as usize);
            &*(base.add(16 * i as usize) as *const RawInterfaceEntry)
        }
    }

    /// Find the vtable start slot for an implemented interface.
    pub fn interface_start_slot(self, interface_mt: MethodTablePtr) -> Option<u16> {
        for i in 0..self.num_interfaces() {
            let e = self.interface_entry(i);
            if e.interface_mt == interface_mt.addr() {
                return Some(e.start_slot as u16);
            }
        }
        None
    }

    /// Whether instances are reference types (not value types).
    #[inline]
    pub fn is_reference_type(self) -> bool {
        !self.flags().contains(MethodTableFlags::IS_VALUE_TYPE)
    }
}

/// `is_assignable(from, to)`: identity, class hierarchy walk, array
/// covariance, interface map scan.
pub fn is_assignable(from: MethodTablePtr, to: MethodTablePtr) -> bool {
    if from == to {
        return true;
    }

    let from_flags = from.flags();
    let to_flags = to.flags();

    // Array covariance: both arrays, reference-typed elements, and
    // component-wise assignable. Value-type element arrays are invariant
    // (identity already handled above).
    if from_flags.contains(MethodTableFlags::IS_ARRAY) {
        if to_flags.contains(MethodTableFlags::IS_ARRAY) {
            let (Some(fe), Some(te)) = (from.related_type(), to.related_type()) else {
                return false;
            };
            return fe.is_reference_type() && te.is_reference_type() && is_assignable(fe, te);
        }
        return false;
    }

    // Interface: scan the implementation map.
    if to_flags.contains(MethodTableFlags::IS_INTERFACE) {
        let mut cur = Some(from);
        while let Some(mt) = cur {
            if mt.interface_start_slot(to).is_some() {
                return true;
            }
            cur = mt.related_type();
        }
        return false;
    }

    // Class hierarchy: walk the parent chain.
    let mut cur = from.related_type();
    while let Some(mt) = cur {
        if mt == to {
            return true;
        }
        cur = mt.related_type();
    }
    false
}

static NEXT_HASH: AtomicU32 = AtomicU32::new(0x1001);

/// Builder for process-lifetime MethodTables.
pub struct MethodTableBuilder {
    component_size: u16,
    flags: MethodTableFlags,
    base_size: u32,
    related_type: Option<MethodTablePtr>,
    vtable: Vec<u64>,
    interfaces: Vec<(MethodTablePtr, u16)>,
}

impl MethodTableBuilder {
    /// A class with the given instance size (including the MT word).
    pub fn class(base_size: u32) -> Self {
        Self {
            component_size: 0,
            flags: MethodTableFlags::empty(),
            base_size,
            related_type: None,
            vtable: Vec::new(),
            interfaces: Vec::new(),
        }
    }

    /// Mark the instances as containing GC references.
    pub fn has_pointers(mut self) -> Self {
        self.flags |= MethodTableFlags::HAS_POINTERS;
        self
    }

    /// Mark the type as a value type.
    pub fn value_type(mut self) -> Self {
        self.flags |= MethodTableFlags::IS_VALUE_TYPE;
        self
    }

    /// Mark the type as an interface.
    pub fn interface(mut self) -> Self {
        self.flags |= MethodTableFlags::IS_INTERFACE;
        self
    }

    /// Mark the type as the string type with UTF-16 components.
    pub fn string(mut self) -> Self {
        self.flags |= MethodTableFlags::IS_STRING | MethodTableFlags::HAS_COMPONENT_SIZE;
        self.component_size = 2;
        self
    }

    /// Set the base class.
    pub fn parent(mut self, parent: MethodTablePtr) -> Self {
        self.related_type = Some(parent);
        self
    }

    /// Append a vtable slot; returns its index.
    pub fn vtable_slot(mut self, entry: u64) -> Self {
        self.vtable.push(entry);
        self
    }

    /// Declare an implemented interface starting at `start_slot`.
    pub fn implements(mut self, interface_mt: MethodTablePtr, start_slot: u16) -> Self {
        self.interfaces.push((interface_mt, start_slot));
        self
    }

    /// Build an array MethodTable over `element`.
    pub fn array_of(element: MethodTablePtr, component_size: u16) -> Self {
        let mut flags = MethodTableFlags::IS_ARRAY | MethodTableFlags::HAS_COMPONENT_SIZE;
        if element.is_reference_type() {
            // Reference-element arrays are traced.
            flags |= MethodTableFlags::HAS_POINTERS;
        }
        Self {
            component_size,
            flags,
            base_size: 16,
            related_type: Some(element),
            vtable: Vec::new(),
            interfaces: Vec::new(),
        }
    }

    /// Allocate and initialize the table. The storage is leaked; the
    /// returned pointer is valid for the life of the process.
    pub fn build(self) -> MethodTablePtr {
        let total = MT_HEADER_SIZE + 8 * self.vtable.len() + 16 * self.interfaces.len();
        let mut buf = vec![0u8; total].into_boxed_slice();
        let ptr = buf.as_mut_ptr();

        let hash_code = NEXT_HASH.fetch_add(1, Ordering::Relaxed);
        unsafe {
            let hdr = ptr as *mut RawHeader;
            (*hdr).component_size = self.component_size;
            (*hdr).flags = self.flags.bits();
            (*hdr).base_size = self.base_size;
            (*hdr).related_type = self.related_type.map_or(0, MethodTablePtr::addr);
            (*hdr).num_vtable_slots = self.vtable.len() as u16;
            (*hdr).num_interfaces = self.interfaces.len() as u16;
            (*hdr).hash_code = hash_code;

            let mut p = ptr.add(MT_VTABLE_OFFSET) as *mut u64;
            for &slot in &self.vtable {
                p.write(slot);
                p = p.add(1);
            }
            let mut e = p as *mut RawInterfaceEntry;
            for &(imt, start) in &self.interfaces {
                (*e).interface_mt = imt.addr();
                (*e).start_slot = start as u32;
                (*e)._pad = 0;
                e = e.add(1);
            }
        }

        let leaked = Box::leak(buf);
        MethodTablePtr(NonNull::new(leaked.as_mut_ptr()).unwrap())
    }
}
