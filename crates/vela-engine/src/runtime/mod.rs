//! Process-wide runtime wiring
//!
//! [`Runtime`] owns every singleton the subsystems share and wires them in
//! the required order: code heap → GC heap → unwind registry → method
//! registry → JIT helpers. `runtime()` hands out the lazily-initialized
//! instance.
//!
//! The runtime also owns the world lock that makes stop-the-world safe
//! against in-flight runtime entries: every managed→runtime crossing holds
//! a (recursive) read share for its duration, and the collector takes the
//! write side while the heap is being walked and swept.

pub mod helpers;
pub mod method_registry;
pub mod platform;
pub mod strings;
pub mod stubs;
pub mod thread;
pub mod tokens;

pub use helpers::{HelperAddrs, WellKnownException, WELL_KNOWN_EXCEPTION_COUNT};
pub use platform::{CooperativeScheduler, DebugConsole, SchedulerHooks, StderrConsole};
pub use method_registry::{constructor_token, DispatchKind, MethodEntry, MethodRegistry};
pub use strings::StringLiteralTable;
pub use thread::{MutatorThread, ThreadRegistry, TransitionFrame};
pub use tokens::{calli_sig, decode_calli_sig, FieldDesc, StaticField, StaticFieldTable, TypeTokenTable};

use crate::gc::{Collector, GcInfoIndex, SafepointCoordinator, StaticRootRegistry, StopReason};
use crate::heap::{CodeHeap, GcHeap};
use crate::types::{MethodTableBuilder, MethodTablePtr, ObjectRef};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;
use vela_unwind::FunctionTableRegistry;

/// Default code heap size.
const CODE_HEAP_BYTES: usize = 8 << 20;
/// Default GC heap size.
const GC_HEAP_BYTES: usize = 32 << 20;

/// Preallocated well-known exception instances plus their types.
pub struct WellKnownExceptions {
    mts: [MethodTablePtr; WELL_KNOWN_EXCEPTION_COUNT],
    /// Fixed root region holding the preallocated instances.
    objects: Box<[u64; WELL_KNOWN_EXCEPTION_COUNT]>,
}

impl WellKnownExceptions {
    fn install(gc_heap: &GcHeap, static_roots: &StaticRootRegistry) -> Self {
        let base = MethodTableBuilder::class(16).build();
        let mts = core::array::from_fn(|_| MethodTableBuilder::class(16).parent(base).build());
        let mut objects = Box::new([0u64; WELL_KNOWN_EXCEPTION_COUNT]);
        for (i, &mt) in mts.iter().enumerate() {
            let p = gc_heap
                .alloc(mt.base_size() as usize)
                .expect("gc heap too small for exception preallocation");
            let obj = ObjectRef::from_payload(p);
            obj.set_method_table(mt);
            objects[i] = obj.addr();
        }
        static_roots.register(objects.as_ptr() as u64, WELL_KNOWN_EXCEPTION_COUNT);
        Self { mts, objects }
    }

    /// The MethodTable of a well-known exception kind.
    pub fn method_table(&self, kind: WellKnownException) -> MethodTablePtr {
        self.mts[kind as usize]
    }

    /// The preallocated instance of a well-known exception kind.
    pub fn object(&self, kind: WellKnownException) -> u64 {
        self.objects[kind as usize]
    }
}

/// The process runtime.
pub struct Runtime {
    /// Executable code pages.
    pub code_heap: Arc<CodeHeap>,
    /// Managed object heap.
    pub gc_heap: Arc<GcHeap>,
    /// RIP-range function tables.
    pub unwind: Arc<FunctionTableRegistry>,
    /// Token → method entries.
    pub methods: MethodRegistry,
    /// Token → MethodTables.
    pub types: TypeTokenTable,
    /// Token → static fields.
    pub statics: StaticFieldTable,
    /// String literal interning.
    pub strings: StringLiteralTable,
    /// Static GC root regions.
    pub static_roots: Arc<StaticRootRegistry>,
    /// Code-range → GCInfo blobs.
    pub gcinfo: Arc<GcInfoIndex>,
    /// The collector.
    pub collector: Collector,
    /// Safepoint coordination.
    pub safepoints: SafepointCoordinator,
    /// Mutator threads.
    pub threads: ThreadRegistry,
    /// Helper addresses for the JIT.
    pub helpers: HelperAddrs,
    /// Well-known exception types and instances.
    pub exceptions: WellKnownExceptions,
    /// Diagnostic byte sink (panic/fatal paths).
    pub console: &'static dyn DebugConsole,
    /// Scheduler surface the collector drives.
    pub scheduler: &'static dyn SchedulerHooks,
    /// The string MethodTable (`ldstr`, literal interning).
    pub string_mt: MethodTablePtr,
    /// Cache of array MethodTables by element type.
    array_mts: DashMap<u64, MethodTablePtr>,
    /// World lock: shared by runtime entries, exclusive during collection.
    world: RwLock<()>,
}

static RUNTIME: Lazy<Runtime> = Lazy::new(Runtime::init);

/// The process runtime singleton.
pub fn runtime() -> &'static Runtime {
    &RUNTIME
}

impl Runtime {
    fn init() -> Self {
        // Wiring order matters: code heap first (helper wrappers live
        // there), then the GC heap (exception preallocation), then the
        // unwind registry and method registry the JIT publishes into.
        let code_heap = Arc::new(CodeHeap::new(CODE_HEAP_BYTES).expect("code heap"));
        let gc_heap = Arc::new(GcHeap::new(GC_HEAP_BYTES).expect("gc heap"));
        let static_roots = Arc::new(StaticRootRegistry::new());
        let gcinfo = Arc::new(GcInfoIndex::new());
        let unwind = Arc::new(FunctionTableRegistry::new());
        let collector = Collector::new(
            gc_heap.clone(),
            static_roots.clone(),
            gcinfo.clone(),
            unwind.clone(),
        );

        let methods = MethodRegistry::new();
        let helpers = HelperAddrs::install(&code_heap);
        helpers.register_well_known(&methods);

        let exceptions = WellKnownExceptions::install(&gc_heap, &static_roots);
        let strings = StringLiteralTable::new();
        let (str_roots, str_count) = strings.root_region();
        static_roots.register(str_roots, str_count);
        let string_mt = MethodTableBuilder::class(16).string().build();

        log::debug!(
            "runtime initialized: code heap {} KiB, gc heap {} KiB",
            CODE_HEAP_BYTES / 1024,
            GC_HEAP_BYTES / 1024
        );

        Self {
            code_heap,
            gc_heap,
            unwind,
            methods,
            types: TypeTokenTable::new(),
            statics: StaticFieldTable::new(),
            strings,
            static_roots,
            gcinfo,
            collector,
            safepoints: SafepointCoordinator::new(),
            threads: ThreadRegistry::new(),
            helpers,
            exceptions,
            console: &StderrConsole,
            scheduler: &CooperativeScheduler,
            string_mt,
            array_mts: DashMap::new(),
            world: RwLock::new(()),
        }
    }

    /// Register an AOT image's function table at its firmware-provided
    /// load address, rebasing every `RUNTIME_FUNCTION` against it. Boot
    /// code calls this before any managed frame can exist.
    pub fn register_aot_image(
        &self,
        load_address: u64,
        functions: Vec<vela_unwind::RuntimeFunction>,
    ) -> vela_unwind::TableId {
        self.unwind.add(load_address, functions)
    }

    /// The array MethodTable for an element type, built on first use.
    pub fn array_mt_of(&self, element: MethodTablePtr) -> MethodTablePtr {
        if let Some(mt) = self.array_mts.get(&element.addr()) {
            return *mt;
        }
        let component = if element.is_reference_type() {
            8
        } else {
            (element.base_size() as u16).saturating_sub(8).max(1)
        };
        let mt = MethodTableBuilder::array_of(element, component).build();
        self.array_mts.insert(element.addr(), mt);
        mt
    }

    /// Acquire a world share for a runtime entry. Recursive so nested
    /// entries on one thread never self-deadlock against a waiting
    /// collector.
    pub(crate) fn world_enter_shared(&self) {
        core::mem::forget(self.world.read_recursive());
    }

    /// Release one world share.
    pub(crate) fn world_exit_shared(&self) {
        // Safety: paired with a forgotten read_recursive guard.
        unsafe { self.world.force_unlock_read() };
    }

    /// Mutator safepoint poll (Rust-side callers; emitted code reaches the
    /// same coordinator through the transition stub).
    pub fn poll(&self) {
        self.safepoints.poll();
    }

    /// Stop the world, collect, resume. Returns `(blocks freed, bytes
    /// freed)`.
    pub fn collect(&self) -> (usize, usize) {
        let me = self.threads.register_current();

        // If this thread entered through helpers it holds world shares;
        // release them for the exclusive acquisition and retake after.
        let own_shares = me.transition_depth();
        for _ in 0..own_shares {
            self.world_exit_shared();
        }

        self.scheduler
            .suspend_all_except_self(StopReason::GarbageCollection);
        let world = self.world.write();

        // Every other registered thread must be parked at a poll or pinned
        // inside the runtime (blocked on the world lock we now hold).
        loop {
            let threads = self.threads.threads();
            let pinned = threads
                .iter()
                .filter(|t| t.id() != me.id() && t.in_runtime())
                .count();
            let expected = threads
                .len()
                .saturating_sub(1)
                .saturating_sub(pinned);
            if self.safepoints.parked_count() >= expected {
                break;
            }
            std::thread::yield_now();
        }

        let threads = self.threads.threads();
        let result = self.collector.collect_stopped(&threads);

        self.scheduler.resume_all();
        drop(world);
        for _ in 0..own_shares {
            self.world_enter_shared();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_initializes_once() {
        let rt = runtime();
        assert!(rt.code_heap.used() > 0); // helper wrappers emitted
        assert!(rt.gc_heap.alloc_count() >= WELL_KNOWN_EXCEPTION_COUNT);
        assert!(rt.static_roots.region_count() >= 2);

        // Helper tokens are resolvable.
        assert!(rt.methods.get(helpers::tokens::RHP_NEW_FAST).is_some());
        assert!(rt.methods.get(helpers::tokens::GC_COLLECT).is_some());
    }

    #[test]
    fn test_array_mt_cache_returns_same_table() {
        let rt = runtime();
        let elem = MethodTableBuilder::class(16).build();
        let a = rt.array_mt_of(elem);
        let b = rt.array_mt_of(elem);
        assert_eq!(a, b);
        assert_eq!(a.related_type(), Some(elem));
        assert_eq!(a.component_size(), 8);
    }

    #[test]
    fn test_exception_objects_preallocated_and_typed() {
        let rt = runtime();
        let oom = rt.exceptions.object(WellKnownException::OutOfMemory);
        let ovf = rt.exceptions.object(WellKnownException::Overflow);
        assert_ne!(oom, 0);
        assert_ne!(ovf, 0);
        assert_ne!(oom, ovf);

        let obj = ObjectRef::from_addr(ovf).unwrap();
        assert_eq!(
            obj.method_table(),
            Some(rt.exceptions.method_table(WellKnownException::Overflow))
        );
    }

    #[test]
    fn test_collect_from_unmanaged_thread() {
        let _serial = crate::test_sync::serial();
        let rt = runtime();
        rt.threads.register_current();
        // No managed frames anywhere: the collection must still complete.
        let _ = rt.collect();
        assert!(rt.collector.stats().collections >= 1);
        rt.threads.unregister_current();
    }
}
