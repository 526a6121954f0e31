//! Stop-the-world mark/sweep collection
//!
//! The collector stops mutators cooperatively (see `safepoint`), enumerates
//! static roots, walks each mutator stack with the unwinder + per-method
//! GCInfo, marks transitively through object interiors, then sweeps
//! unmarked blocks onto the free list.
//!
//! Stack slots are precise (typed by GCInfo liveness); object interiors are
//! scanned conservatively word by word under `HAS_POINTERS`. Words that do
//! not point into the heap are ignored.

use crate::gc::gcinfo::{GcInfo, SlotBase};
use crate::gc::roots::{GcInfoIndex, StaticRootRegistry};
use crate::heap::GcHeap;
use crate::runtime::thread::{MutatorThread, TransitionFrame};
use crate::types::{MethodTableFlags, ObjectRef, ARRAY_DATA_OFFSET, OBJECT_HEADER_SIZE};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vela_unwind::{unwind_one, Context, FunctionTableRegistry, StepResult, UnwindError};

/// Collection statistics, updated after every cycle.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total number of collections.
    pub collections: usize,
    /// Total objects freed.
    pub objects_freed: usize,
    /// Total bytes freed.
    pub bytes_freed: usize,
    /// Objects marked in the last collection.
    pub last_marked: usize,
    /// Objects freed in the last collection.
    pub last_freed: usize,
    /// Bytes freed in the last collection.
    pub last_freed_bytes: usize,
    /// Duration of the last pause.
    pub last_pause: Duration,
    /// Sum of all pauses.
    pub total_pause: Duration,
}

impl GcStats {
    fn update(&mut self, pause: Duration, marked: usize, freed: usize, freed_bytes: usize) {
        self.collections += 1;
        self.objects_freed += freed;
        self.bytes_freed += freed_bytes;
        self.last_marked = marked;
        self.last_freed = freed;
        self.last_freed_bytes = freed_bytes;
        self.last_pause = pause;
        self.total_pause += pause;
    }
}

/// The mark phase state: worklist plus counters.
struct Marker<'a> {
    heap: &'a GcHeap,
    worklist: Vec<NonNull<u8>>,
    marked: usize,
}

impl<'a> Marker<'a> {
    /// Consider one word as a potential reference. Interior pointers
    /// resolve to their containing block; words outside the heap are
    /// ignored.
    fn visit_word(&mut self, word: u64) {
        let Some(payload) = self.heap.block_payload_containing(word) else {
            return;
        };
        // Safety: the payload came out of this heap.
        if unsafe { self.heap.mark_payload(payload) } {
            self.marked += 1;
            self.worklist.push(payload);
        }
    }

    /// Trace interiors until the worklist drains.
    fn drain(&mut self) {
        while let Some(payload) = self.worklist.pop() {
            let obj = ObjectRef::from_payload(payload);
            let Some(mt) = obj.method_table() else {
                continue;
            };
            let flags = mt.flags();
            if !flags.contains(MethodTableFlags::HAS_POINTERS) {
                continue;
            }
            if flags.contains(MethodTableFlags::IS_ARRAY) {
                let len = obj.array_len();
                for i in 0..len {
                    let w = obj.read_word(ARRAY_DATA_OFFSET + 8 * i as usize);
                    self.visit_word(w);
                }
            } else {
                let size = mt.base_size() as usize;
                let mut off = OBJECT_HEADER_SIZE;
                while off + 8 <= size {
                    self.visit_word(obj.read_word(off));
                    off += 8;
                }
            }
        }
    }
}

unsafe fn mark_root_slot(ctx: *mut c_void, slot: *mut u64) {
    let marker = unsafe { &mut *(ctx as *mut Marker<'_>) };
    marker.visit_word(unsafe { *slot });
}

/// The stop-the-world mark/sweep collector.
pub struct Collector {
    heap: Arc<GcHeap>,
    static_roots: Arc<StaticRootRegistry>,
    gcinfo: Arc<GcInfoIndex>,
    unwind: Arc<FunctionTableRegistry>,
    stats: parking_lot::Mutex<GcStats>,
}

impl Collector {
    /// Wire a collector over the process registries.
    pub fn new(
        heap: Arc<GcHeap>,
        static_roots: Arc<StaticRootRegistry>,
        gcinfo: Arc<GcInfoIndex>,
        unwind: Arc<FunctionTableRegistry>,
    ) -> Self {
        Self {
            heap,
            static_roots,
            gcinfo,
            unwind,
            stats: parking_lot::Mutex::new(GcStats::default()),
        }
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    /// Run one collection. The caller (`Runtime::collect`) has already
    /// stopped the world; this performs mark and sweep only.
    pub fn collect_stopped(&self, threads: &[Arc<MutatorThread>]) -> (usize, usize) {
        let start = Instant::now();
        let mut marker = Marker {
            heap: &self.heap,
            worklist: Vec::new(),
            marked: 0,
        };

        self.static_roots
            .enumerate(&mut marker as *mut _ as *mut c_void, mark_root_slot);

        for thread in threads {
            self.walk_thread(&mut marker, thread);
        }
        marker.drain();

        let (freed, freed_bytes) = self.heap.sweep();
        let marked = marker.marked;
        let pause = start.elapsed();
        self.stats.lock().update(pause, marked, freed, freed_bytes);
        log::debug!(
            "gc: marked {marked}, freed {freed} blocks / {freed_bytes} bytes in {pause:?}"
        );
        (freed, freed_bytes)
    }

    /// Walk one thread's managed stack segments: start at the newest
    /// transition frame, unwind until the segment leaves registered code,
    /// then fall back to the next older transition frame.
    fn walk_thread(&self, marker: &mut Marker<'_>, thread: &MutatorThread) {
        let mut transitions = thread.transitions();
        let Some(top) = transitions.pop() else {
            return;
        };
        let mut ctx = context_from_transition(&top);
        loop {
            if self.unwind.lookup(ctx.rip).is_none() {
                // End of this managed segment: resume from the next older
                // transition frame, if any.
                match transitions.pop() {
                    Some(t) => {
                        ctx = context_from_transition(&t);
                        continue;
                    }
                    None => return,
                }
            }

            self.visit_frame(marker, &ctx);

            // Safety: the thread is stopped; its stack is stable.
            match unsafe { unwind_one(&self.unwind, &ctx) } {
                Ok(StepResult::Caller(next)) => ctx = next,
                Ok(StepResult::End) => match transitions.pop() {
                    Some(t) => ctx = context_from_transition(&t),
                    None => return,
                },
                Err(UnwindError::UnregisteredRip(_)) => unreachable!("checked above"),
                Err(e) => {
                    log::error!("gc stack walk failed at rip {:#x}: {e}", ctx.rip);
                    return;
                }
            }
        }
    }

    /// Visit the GC-live slots of one frame, per its GCInfo and the safe
    /// point at or before the frame's RIP offset.
    fn visit_frame(&self, marker: &mut Marker<'_>, ctx: &Context) {
        let Some((code_begin, blob)) = self.gcinfo.lookup(ctx.rip) else {
            return;
        };
        let info = match GcInfo::decode(&blob) {
            Ok(i) => i,
            Err(e) => {
                log::error!("undecodable GCInfo at {:#x}: {e}", code_begin);
                return;
            }
        };
        let offset = (ctx.rip - code_begin) as u32;
        let Some(sp) = info.safe_point_at_or_before(offset) else {
            return;
        };
        for slot_idx in 0..info.num_slots() {
            if !info.is_slot_live(sp, slot_idx) {
                continue;
            }
            let slot = info.slot(slot_idx);
            let base = match slot.base {
                SlotBase::FramePointer => ctx.rbp(),
                SlotBase::Sp => ctx.rsp(),
                // The caller's stack pointer at entry sits two words above
                // the frame pointer (saved RBP + return address).
                SlotBase::CallerSp => ctx.rbp() + 16,
            };
            let addr = base.wrapping_add(slot.offset as i64 as u64);
            let word = unsafe { core::ptr::read(addr as *const u64) };
            marker.visit_word(word);
        }
    }
}

fn context_from_transition(t: &TransitionFrame) -> Context {
    let mut ctx = Context::zeroed();
    ctx.rip = t.rip;
    ctx.set_rsp(t.rsp);
    ctx.set_rbp(t.rbp);
    ctx
}
