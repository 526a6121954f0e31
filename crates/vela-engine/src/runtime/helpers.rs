//! Runtime helpers callable from emitted code
//!
//! Every helper the JIT bakes into emitted call sequences lives here. The
//! ones that can touch the GC heap or run managed funclets are reached
//! through a generated wrapper that routes the call via the transition
//! stub, so a stack walk started inside the helper always finds the
//! managed call site. Wrappers are tiny code-heap stubs:
//!
//! ```text
//! mov rax, helper      ; 48 B8 imm64
//! mov r11, thunk       ; 49 BB imm64
//! jmp r11              ; 41 FF E3
//! ```
//!
//! The thunk sees the original return address, so the transition frame it
//! publishes describes the emitted call site, not the wrapper.

use crate::eh::dispatch::{dispatch_rethrow, raise_from_runtime};
use crate::heap::CodeHeap;
use crate::runtime::runtime;
use crate::runtime::stubs::{vela_call_funclet, vela_throw_stub, vela_transition_call_stub};
use crate::types::{is_assignable, MethodTablePtr, ObjectRef, ARRAY_DATA_OFFSET};
use vela_il::ReturnKind;
use vela_unwind::unwinder::load_unwind_info;
use vela_unwind::UnwindFlags;

/// Well-known exception kinds with preallocated instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum WellKnownException {
    /// Allocation failure.
    OutOfMemory = 0,
    /// Overflow-checked arithmetic or conversion tripped.
    Overflow = 1,
    /// Integer division or remainder by zero.
    DivideByZero = 2,
    /// Array index outside `[0, length)`.
    IndexOutOfRange = 3,
    /// `castclass`/`unbox` against an incompatible type.
    InvalidCast = 4,
    /// Member access through a null reference.
    NullReference = 5,
}

/// Number of well-known exception kinds.
pub const WELL_KNOWN_EXCEPTION_COUNT: usize = 6;

/// Well-known method-registry tokens for the helpers emitted code calls
/// through the registry.
pub mod tokens {
    /// `rhp_new_fast(MT*)`.
    pub const RHP_NEW_FAST: u32 = 0x0A00_0001;
    /// `rhp_new_array(MT*, n)`.
    pub const RHP_NEW_ARRAY: u32 = 0x0A00_0002;
    /// `rhp_new_md_array2d(MT*, d0, d1)`.
    pub const RHP_NEW_MD_ARRAY_2D: u32 = 0x0A00_0003;
    /// `rhp_new_md_array3d(MT*, d0, d1, d2)`.
    pub const RHP_NEW_MD_ARRAY_3D: u32 = 0x0A00_0004;
    /// `md_array_get_i32_2d(arr, i, j)`.
    pub const MD_ARRAY_GET_I32_2D: u32 = 0x0A00_0005;
    /// `md_array_set_i32_2d(arr, i, j, v)`.
    pub const MD_ARRAY_SET_I32_2D: u32 = 0x0A00_0006;
    /// `md_array_get_i32_3d(arr, i, j, k)`.
    pub const MD_ARRAY_GET_I32_3D: u32 = 0x0A00_0007;
    /// `md_array_set_i32_3d(arr, i, j, k, v)`.
    pub const MD_ARRAY_SET_I32_3D: u32 = 0x0A00_0008;
    /// Force a garbage collection; returns blocks freed.
    pub const GC_COLLECT: u32 = 0x0A00_0009;
}

fn raise(kind: WellKnownException) -> ! {
    let exc = runtime().exceptions.object(kind);
    raise_from_runtime(exc)
}

fn mt_of(addr: u64) -> MethodTablePtr {
    // Safety: MT addresses reaching helpers were baked in at compile time
    // from the type tables.
    unsafe { MethodTablePtr::from_addr(addr) }.expect("null MethodTable in helper")
}

/// `rhp_new_fast`: allocate a class instance.
#[no_mangle]
pub extern "win64" fn vela_rhp_new_fast(mt_addr: u64) -> u64 {
    let mt = mt_of(mt_addr);
    let rt = runtime();
    match rt.gc_heap.alloc(mt.base_size() as usize) {
        Some(p) => {
            let obj = ObjectRef::from_payload(p);
            obj.set_method_table(mt);
            obj.addr()
        }
        None => raise(WellKnownException::OutOfMemory),
    }
}

/// `rhp_new_array`: allocate a single-dimensional array of `len` elements.
#[no_mangle]
pub extern "win64" fn vela_rhp_new_array(elem_mt_addr: u64, len: i64) -> u64 {
    if len < 0 {
        raise(WellKnownException::Overflow);
    }
    let rt = runtime();
    let elem = mt_of(elem_mt_addr);
    let arr_mt = rt.array_mt_of(elem);
    let size = ARRAY_DATA_OFFSET + len as usize * arr_mt.component_size() as usize;
    match rt.gc_heap.alloc(size) {
        Some(p) => {
            let obj = ObjectRef::from_payload(p);
            obj.set_method_table(arr_mt);
            obj.set_array_len(len as u64);
            obj.addr()
        }
        None => raise(WellKnownException::OutOfMemory),
    }
}

fn new_md_array(elem_mt_addr: u64, dims: &[i64]) -> u64 {
    if dims.iter().any(|&d| d < 0) {
        raise(WellKnownException::Overflow);
    }
    let rt = runtime();
    let elem = mt_of(elem_mt_addr);
    let arr_mt = rt.array_mt_of(elem);
    let total: i64 = dims.iter().product();
    let rank = dims.len() as u64;
    let header_words = 3 + 2 * rank;
    let size = header_words as usize * 8 + total as usize * arr_mt.component_size() as usize;
    let Some(p) = rt.gc_heap.alloc(size) else {
        raise(WellKnownException::OutOfMemory)
    };
    let obj = ObjectRef::from_payload(p);
    obj.set_method_table(arr_mt);
    obj.set_array_len(total as u64);
    obj.write_word(16, rank);
    for (i, &d) in dims.iter().enumerate() {
        obj.write_word(24 + 8 * i, d as u64);
        // Lower bounds stay zero.
    }
    obj.addr()
}

/// `rhp_new_md_array2d`.
#[no_mangle]
pub extern "win64" fn vela_rhp_new_md_array2d(elem_mt: u64, d0: i64, d1: i64) -> u64 {
    new_md_array(elem_mt, &[d0, d1])
}

/// `rhp_new_md_array3d`.
#[no_mangle]
pub extern "win64" fn vela_rhp_new_md_array3d(elem_mt: u64, d0: i64, d1: i64, d2: i64) -> u64 {
    new_md_array(elem_mt, &[d0, d1, d2])
}

fn md_element_ptr(arr_addr: u64, indices: &[i64]) -> *mut i32 {
    let Some(arr) = ObjectRef::from_addr(arr_addr) else {
        raise(WellKnownException::NullReference)
    };
    let rank = arr.read_word(16);
    if rank as usize != indices.len() {
        raise(WellKnownException::IndexOutOfRange);
    }
    let mut linear: i64 = 0;
    for (i, &idx) in indices.iter().enumerate() {
        let bound = arr.read_word(24 + 8 * i) as i64;
        if idx < 0 || idx >= bound {
            raise(WellKnownException::IndexOutOfRange);
        }
        linear = linear * bound + idx;
    }
    let data = arr.addr() + (3 + 2 * rank) * 8;
    (data + linear as u64 * 4) as *mut i32
}

/// `md_array_get_i32_2d`.
#[no_mangle]
pub extern "win64" fn vela_md_array_get_i32_2d(arr: u64, i: i64, j: i64) -> i64 {
    unsafe { *md_element_ptr(arr, &[i, j]) as i64 }
}

/// `md_array_set_i32_2d`.
#[no_mangle]
pub extern "win64" fn vela_md_array_set_i32_2d(arr: u64, i: i64, j: i64, v: i64) {
    unsafe { *md_element_ptr(arr, &[i, j]) = v as i32 }
}

/// `md_array_get_i32_3d`.
#[no_mangle]
pub extern "win64" fn vela_md_array_get_i32_3d(arr: u64, i: i64, j: i64, k: i64) -> i64 {
    unsafe { *md_element_ptr(arr, &[i, j, k]) as i64 }
}

/// `md_array_set_i32_3d`.
#[no_mangle]
pub extern "win64" fn vela_md_array_set_i32_3d(arr: u64, i: i64, j: i64, k: i64, v: i64) {
    unsafe { *md_element_ptr(arr, &[i, j, k]) = v as i32 }
}

/// Interface dispatch: find the implementation entrypoint for
/// `(receiver, interface, method index)`.
#[no_mangle]
pub extern "win64" fn vela_rt_resolve_interface(obj: u64, iface_mt: u64, index: u64) -> u64 {
    let Some(obj) = ObjectRef::from_addr(obj) else {
        raise(WellKnownException::NullReference)
    };
    let Some(mt) = obj.method_table() else {
        raise(WellKnownException::InvalidCast)
    };
    let iface = mt_of(iface_mt);
    match mt.interface_start_slot(iface) {
        Some(start) => mt.vtable_slot(start + index as u16),
        None => raise(WellKnownException::InvalidCast),
    }
}

/// `isinst`: the object when assignment-compatible, else null.
#[no_mangle]
pub extern "win64" fn vela_rt_isinst(obj: u64, mt_addr: u64) -> u64 {
    let Some(obj_ref) = ObjectRef::from_addr(obj) else {
        return 0;
    };
    let target = mt_of(mt_addr);
    match obj_ref.method_table() {
        Some(mt) if is_assignable(mt, target) => obj,
        _ => 0,
    }
}

/// `castclass`: the object (null passes), or an InvalidCastException.
#[no_mangle]
pub extern "win64" fn vela_rt_castclass(obj: u64, mt_addr: u64) -> u64 {
    let Some(obj_ref) = ObjectRef::from_addr(obj) else {
        return 0;
    };
    let target = mt_of(mt_addr);
    match obj_ref.method_table() {
        Some(mt) if is_assignable(mt, target) => obj,
        _ => raise(WellKnownException::InvalidCast),
    }
}

/// `unbox`: a pointer to the boxed payload after a type check.
#[no_mangle]
pub extern "win64" fn vela_rt_unbox(obj: u64, mt_addr: u64) -> u64 {
    let Some(obj_ref) = ObjectRef::from_addr(obj) else {
        raise(WellKnownException::NullReference)
    };
    let target = mt_of(mt_addr);
    match obj_ref.method_table() {
        Some(mt) if mt == target || is_assignable(mt, target) => obj + 8,
        _ => raise(WellKnownException::InvalidCast),
    }
}

/// `box`: allocate an instance of `mt` and store the value word after the
/// MT word. Larger value types are filled by emitted `stobj` through the
/// returned reference.
#[no_mangle]
pub extern "win64" fn vela_rt_box(mt_addr: u64, value: u64) -> u64 {
    let mt = mt_of(mt_addr);
    let rt = runtime();
    match rt.gc_heap.alloc(mt.base_size() as usize) {
        Some(p) => {
            let obj = ObjectRef::from_payload(p);
            obj.set_method_table(mt);
            obj.write_word(8, value);
            obj.addr()
        }
        None => raise(WellKnownException::OutOfMemory),
    }
}

/// `stelem.ref`: bounds check, covariance check, store.
#[no_mangle]
pub extern "win64" fn vela_rt_stelem_ref(arr: u64, index: i64, value: u64) {
    let Some(arr_ref) = ObjectRef::from_addr(arr) else {
        raise(WellKnownException::NullReference)
    };
    if index < 0 || index as u64 >= arr_ref.array_len() {
        raise(WellKnownException::IndexOutOfRange);
    }
    if value != 0 {
        let elem_mt = arr_ref
            .method_table()
            .and_then(|mt| mt.related_type())
            .unwrap_or_else(|| raise(WellKnownException::InvalidCast));
        let val_mt = ObjectRef::from_addr(value)
            .and_then(|o| o.method_table())
            .unwrap_or_else(|| raise(WellKnownException::InvalidCast));
        if !is_assignable(val_mt, elem_mt) {
            raise(WellKnownException::InvalidCast);
        }
    }
    unsafe {
        let slot = (arr + ARRAY_DATA_OFFSET as u64 + index as u64 * 8) as *mut u64;
        slot.write(value);
    }
}

/// `ldvirtftn`: resolve a virtual/interface token through a receiver.
#[no_mangle]
pub extern "win64" fn vela_rt_ldvirtftn(obj: u64, token: u64) -> u64 {
    let Some(obj_ref) = ObjectRef::from_addr(obj) else {
        raise(WellKnownException::NullReference)
    };
    match runtime().methods.resolve(token as u32, Some(obj_ref)) {
        Some(entry) => entry,
        None => raise(WellKnownException::InvalidCast),
    }
}

/// `leave` processing: run the finally/fault funclets of every clause
/// whose protected region contains the leave site but not the target.
/// `site` and `target` are absolute addresses inside the leaving method.
#[no_mangle]
pub extern "win64" fn vela_rt_leave(site: u64, target: u64, frame: u64) {
    let rt = runtime();
    let Some((_, image_base)) = rt.unwind.lookup(site) else {
        return;
    };
    // The clause table hangs off the method's main RUNTIME_FUNCTION (which
    // begins at the image base); `site` may be inside a handler funclet.
    let Some((main_func, _)) = rt.unwind.lookup(image_base) else {
        return;
    };
    let info = match unsafe { load_unwind_info(image_base, main_func.unwind_info_rva) } {
        Ok(i) => i,
        Err(_) => return,
    };
    if !info.flags.contains(UnwindFlags::EHANDLER) {
        return;
    }
    let clauses = crate::eh::parse_clause_table(&info.handler_data);

    let mut site_off = (site - image_base) as u32;
    // A leave inside a handler funclet sits outside every native try
    // range; treat it as leaving from the handler's protected region so
    // enclosing finallys still run.
    if let Some(owner) = clauses.iter().find(|c| c.handler_contains(site_off)) {
        site_off = owner.try_begin;
    }
    let target_off = (target - image_base) as u32;

    for clause in &clauses {
        if (clause.kind == crate::eh::CLAUSE_FINALLY || clause.kind == crate::eh::CLAUSE_FAULT)
            && clause.try_contains(site_off)
            && !clause.try_contains(target_off)
        {
            let funclet = image_base + clause.handler_begin as u64;
            unsafe { vela_call_funclet(funclet, 0, frame, core::ptr::null()) };
        }
    }
}

/// `rethrow` from a handler funclet.
#[no_mangle]
pub extern "win64" fn vela_rt_rethrow() -> u64 {
    dispatch_rethrow()
}

/// Force a collection (the S10 hook and the embedder's collect surface).
#[no_mangle]
pub extern "win64" fn vela_gc_collect() -> u64 {
    runtime().collect().0 as u64
}

/// Addresses the JIT bakes into emitted code. Helpers that may allocate,
/// raise, or run funclets carry wrapper addresses (transition-routed);
/// direct entries are safe to call straight from emitted code.
#[derive(Debug, Clone, Copy)]
pub struct HelperAddrs {
    /// Wrapped `vela_rhp_new_fast`.
    pub new_fast: u64,
    /// Wrapped `vela_rhp_new_array`.
    pub new_array: u64,
    /// Wrapped `vela_rhp_new_md_array2d`.
    pub new_md_array2d: u64,
    /// Wrapped `vela_rhp_new_md_array3d`.
    pub new_md_array3d: u64,
    /// Wrapped `vela_md_array_get_i32_2d`.
    pub md_get_i32_2d: u64,
    /// Wrapped `vela_md_array_set_i32_2d`.
    pub md_set_i32_2d: u64,
    /// Wrapped `vela_md_array_get_i32_3d`.
    pub md_get_i32_3d: u64,
    /// Wrapped `vela_md_array_set_i32_3d`.
    pub md_set_i32_3d: u64,
    /// Wrapped `vela_rt_resolve_interface`.
    pub resolve_interface: u64,
    /// Wrapped `vela_rt_isinst`.
    pub isinst: u64,
    /// Wrapped `vela_rt_castclass`.
    pub castclass: u64,
    /// Wrapped `vela_rt_unbox`.
    pub unbox: u64,
    /// Wrapped `vela_rt_box`.
    pub box_value: u64,
    /// Wrapped `vela_rt_stelem_ref`.
    pub stelem_ref: u64,
    /// Wrapped `vela_rt_ldvirtftn`.
    pub ldvirtftn: u64,
    /// Wrapped `vela_rt_leave`.
    pub leave: u64,
    /// Wrapped `vela_gc_collect`.
    pub gc_collect: u64,
    /// Direct: `vela_rt_rethrow` (enters the dispatcher, no transition).
    pub rethrow: u64,
    /// Direct: the throw capture stub.
    pub throw_stub: u64,
}

fn emit_wrapper(code_heap: &CodeHeap, helper: u64) -> u64 {
    let stub = code_heap
        .alloc(23, 16)
        .expect("code heap exhausted while emitting helper wrappers");
    let thunk = vela_transition_call_stub as usize as u64;
    let mut bytes = [0u8; 23];
    bytes[0] = 0x48;
    bytes[1] = 0xB8;
    bytes[2..10].copy_from_slice(&helper.to_le_bytes());
    bytes[10] = 0x49;
    bytes[11] = 0xBB;
    bytes[12..20].copy_from_slice(&thunk.to_le_bytes());
    bytes[20] = 0x41;
    bytes[21] = 0xFF;
    bytes[22] = 0xE3;
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), stub.as_ptr(), bytes.len()) };
    stub.addr()
}

impl HelperAddrs {
    /// Emit wrappers into the code heap and capture every address.
    pub fn install(code_heap: &CodeHeap) -> Self {
        let wrap = |f: u64| emit_wrapper(code_heap, f);
        Self {
            new_fast: wrap(vela_rhp_new_fast as usize as u64),
            new_array: wrap(vela_rhp_new_array as usize as u64),
            new_md_array2d: wrap(vela_rhp_new_md_array2d as usize as u64),
            new_md_array3d: wrap(vela_rhp_new_md_array3d as usize as u64),
            md_get_i32_2d: wrap(vela_md_array_get_i32_2d as usize as u64),
            md_set_i32_2d: wrap(vela_md_array_set_i32_2d as usize as u64),
            md_get_i32_3d: wrap(vela_md_array_get_i32_3d as usize as u64),
            md_set_i32_3d: wrap(vela_md_array_set_i32_3d as usize as u64),
            resolve_interface: wrap(vela_rt_resolve_interface as usize as u64),
            isinst: wrap(vela_rt_isinst as usize as u64),
            castclass: wrap(vela_rt_castclass as usize as u64),
            unbox: wrap(vela_rt_unbox as usize as u64),
            box_value: wrap(vela_rt_box as usize as u64),
            stelem_ref: wrap(vela_rt_stelem_ref as usize as u64),
            ldvirtftn: wrap(vela_rt_ldvirtftn as usize as u64),
            leave: wrap(vela_rt_leave as usize as u64),
            gc_collect: wrap(vela_gc_collect as usize as u64),
            rethrow: vela_rt_rethrow as usize as u64,
            throw_stub: vela_throw_stub as usize as u64,
        }
    }

    /// Register the helpers emitted code reaches through the registry.
    pub fn register_well_known(&self, registry: &crate::runtime::MethodRegistry) {
        registry.register(tokens::RHP_NEW_FAST, self.new_fast, 1, ReturnKind::Ref, false);
        registry.register(tokens::RHP_NEW_ARRAY, self.new_array, 2, ReturnKind::Ref, false);
        registry.register(
            tokens::RHP_NEW_MD_ARRAY_2D,
            self.new_md_array2d,
            3,
            ReturnKind::Ref,
            false,
        );
        registry.register(
            tokens::RHP_NEW_MD_ARRAY_3D,
            self.new_md_array3d,
            4,
            ReturnKind::Ref,
            false,
        );
        registry.register(
            tokens::MD_ARRAY_GET_I32_2D,
            self.md_get_i32_2d,
            3,
            ReturnKind::I32,
            false,
        );
        registry.register(
            tokens::MD_ARRAY_SET_I32_2D,
            self.md_set_i32_2d,
            4,
            ReturnKind::Void,
            false,
        );
        registry.register(
            tokens::MD_ARRAY_GET_I32_3D,
            self.md_get_i32_3d,
            4,
            ReturnKind::I32,
            false,
        );
        registry.register(
            tokens::MD_ARRAY_SET_I32_3D,
            self.md_set_i32_3d,
            5,
            ReturnKind::Void,
            false,
        );
        registry.register(tokens::GC_COLLECT, self.gc_collect, 0, ReturnKind::I64, false);
    }
}
