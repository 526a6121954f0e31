//! Two-pass exception dispatch
//!
//! Pass 1 walks frames from the raise site looking for a handler: a typed
//! clause matches when the exception's type is assignment-compatible with
//! the clause token's type; a filter clause matches when its filter funclet
//! returns nonzero. Pass 2 walks the same frames again, running
//! `finally`/`fault` funclets on the way, then transfers control into the
//! matched handler funclet. Funclets receive the exception in RCX and the
//! parent (establisher) frame pointer in RDX; their prolog is the fixed
//! `push rbp; mov rbp, rdx` pair.
//!
//! A catch funclet either returns from the parent method directly (its
//! `ret` pivots the stack through the parent frame) or returns a
//! continuation address to resume in the parent's main body after a
//! `leave`. Control never returns to the raise site.
//!
//! Integrity failures (an unmatched exception, a missing function entry,
//! a corrupt table) are fatal: log and break.

use crate::runtime::runtime;
use crate::runtime::stubs::{vela_call_funclet, vela_restore_context};
use crate::runtime::thread::{ActiveDispatch, TransitionFrame};
use crate::types::{is_assignable, ObjectRef};
use vela_unwind::format::UnwindCode;
use vela_unwind::unwinder::load_unwind_info;
use vela_unwind::{Context, UnwindFlags};

/// Clause kind values as stored in native clause tables (the IL flag
/// values of §II.25.4.6, carried through conversion).
pub const CLAUSE_TYPED: u32 = 0;
/// Filter clause.
pub const CLAUSE_FILTER: u32 = 1;
/// Finally clause.
pub const CLAUSE_FINALLY: u32 = 2;
/// Fault clause.
pub const CLAUSE_FAULT: u32 = 4;

/// One EH clause in native offsets, relative to the method's code base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeEhClause {
    /// Clause kind (`CLAUSE_*`).
    pub kind: u32,
    /// Protected region start.
    pub try_begin: u32,
    /// Protected region end (exclusive).
    pub try_end: u32,
    /// Handler funclet start.
    pub handler_begin: u32,
    /// Handler funclet end (exclusive).
    pub handler_end: u32,
    /// Typed: class token. Filter: filter funclet offset.
    pub token_or_filter_offset: u32,
}

impl NativeEhClause {
    /// Whether `offset` lies in the protected region.
    #[inline]
    pub fn try_contains(&self, offset: u32) -> bool {
        offset >= self.try_begin && offset < self.try_end
    }

    /// Whether `offset` lies in the handler region.
    #[inline]
    pub fn handler_contains(&self, offset: u32) -> bool {
        offset >= self.handler_begin && offset < self.handler_end
    }
}

/// Serialize a clause table into UNWIND_INFO handler data.
pub fn write_clause_table(clauses: &[NativeEhClause]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 24 * clauses.len());
    out.extend_from_slice(&(clauses.len() as u32).to_le_bytes());
    for c in clauses {
        for v in [
            c.kind,
            c.try_begin,
            c.try_end,
            c.handler_begin,
            c.handler_end,
            c.token_or_filter_offset,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

/// Parse a clause table out of UNWIND_INFO handler data. Returns an empty
/// table when the bytes are too short for their own count.
pub fn parse_clause_table(bytes: &[u8]) -> Vec<NativeEhClause> {
    if bytes.len() < 4 {
        return Vec::new();
    }
    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let mut out = Vec::with_capacity(count);
    let rd = |i: usize| -> u32 {
        u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
    };
    for i in 0..count {
        let base = 4 + 24 * i;
        if base + 24 > bytes.len() {
            break;
        }
        out.push(NativeEhClause {
            kind: rd(base),
            try_begin: rd(base + 4),
            try_end: rd(base + 8),
            handler_begin: rd(base + 12),
            handler_end: rd(base + 16),
            token_or_filter_offset: rd(base + 20),
        });
    }
    out
}

fn fatal(msg: &str, rip: u64) -> ! {
    log::error!("fatal exception dispatch failure: {msg} (rip {rip:#x})");
    let line = format!("vela: fatal exception dispatch failure: {msg} (rip {rip:#x})\n");
    runtime().console.write_bytes(line.as_bytes());
    loop {
        unsafe { core::arch::asm!("int3") };
    }
}

/// Per-frame view assembled during a walk.
struct FrameInfo {
    image_base: u64,
    clauses: Vec<NativeEhClause>,
    /// Static allocation of the frame (the prolog's `sub rsp, N`).
    alloc_size: u32,
    /// Offset of the control point within the allocation.
    probe: u32,
}

fn frame_info(ctx: &Context) -> Option<FrameInfo> {
    let rt = runtime();
    let (func, image_base) = rt.unwind.lookup(ctx.rip)?;
    // Safety: registered entries point at live unwind blobs.
    let info = match unsafe { load_unwind_info(image_base, func.unwind_info_rva) } {
        Ok(i) => i,
        Err(e) => fatal(&format!("corrupt UNWIND_INFO: {e}"), ctx.rip),
    };
    let clauses = if info.flags.contains(UnwindFlags::EHANDLER) {
        parse_clause_table(&info.handler_data)
    } else {
        Vec::new()
    };
    let alloc_size = info
        .codes
        .iter()
        .find_map(|c| match *c {
            UnwindCode::Alloc { size, .. } => Some(size),
            _ => None,
        })
        .unwrap_or(0);
    // The RIP of a non-leaf frame is a return address; probe one byte back
    // so a call that ends a try region still matches it.
    let probe = (ctx.rip - image_base).saturating_sub(1) as u32;
    Some(FrameInfo {
        image_base,
        clauses,
        alloc_size,
        probe,
    })
}

fn unwind_next(ctx: &Context) -> Option<Context> {
    let rt = runtime();
    // Safety: dispatch runs on the faulting thread; its stack is live.
    match unsafe { vela_unwind::unwind_one(&rt.unwind, ctx) } {
        Ok(vela_unwind::StepResult::Caller(next)) => Some(next),
        Ok(vela_unwind::StepResult::End) => None,
        Err(vela_unwind::UnwindError::UnregisteredRip(_)) => None,
        Err(e) => fatal(&format!("unwind failed: {e}"), ctx.rip),
    }
}

struct Matched {
    frame_index: usize,
    establisher: u64,
    image_base: u64,
    clause: NativeEhClause,
    clause_index: usize,
    alloc_size: u32,
}

const MAX_WALK_FRAMES: usize = 4096;

/// Run two-pass dispatch. `first_frame_clause_start` skips clauses of the
/// innermost frame (used by `rethrow` to resume the search past the clause
/// that already handled the exception). Never returns.
fn dispatch(exception: u64, throw_ctx: Context, first_frame_clause_start: usize) -> ! {
    let rt = runtime();
    let thread = rt.threads.register_current();
    let exc_obj = match ObjectRef::from_addr(exception) {
        Some(o) => o,
        None => fatal("raised a null exception", throw_ctx.rip),
    };
    let exc_mt = exc_obj.method_table();

    // Publish a transition frame covering the raise site so a collection
    // triggered from a filter or finally funclet can walk the interrupted
    // frames. It is pruned (and its world share released) with the rest of
    // the abandoned region when control enters the handler.
    rt.world_enter_shared();
    thread.push_transition(TransitionFrame {
        rip: throw_ctx.rip,
        rsp: throw_ctx.rsp(),
        rbp: throw_ctx.rbp(),
    });

    // Pass 1: search.
    let mut matched: Option<Matched> = None;
    let mut ctx = throw_ctx.clone();
    'search: for frame_index in 0..MAX_WALK_FRAMES {
        let Some(fi) = frame_info(&ctx) else {
            break;
        };
        let start = if frame_index == 0 {
            first_frame_clause_start
        } else {
            0
        };
        for (ci, clause) in fi.clauses.iter().enumerate().skip(start) {
            if !clause.try_contains(fi.probe) {
                continue;
            }
            let is_match = match clause.kind {
                CLAUSE_TYPED => {
                    let clause_mt = rt.types.resolve(clause.token_or_filter_offset);
                    match (exc_mt, clause_mt) {
                        (Some(e), Some(c)) => is_assignable(e, c),
                        _ => false,
                    }
                }
                CLAUSE_FILTER => {
                    let filter = fi.image_base + clause.token_or_filter_offset as u64;
                    let verdict = unsafe {
                        vela_call_funclet(filter, exception, ctx.rbp(), &throw_ctx)
                    };
                    verdict as u32 != 0
                }
                _ => false,
            };
            if is_match {
                matched = Some(Matched {
                    frame_index,
                    establisher: ctx.rbp(),
                    image_base: fi.image_base,
                    clause: *clause,
                    clause_index: ci,
                    alloc_size: fi.alloc_size,
                });
                break 'search;
            }
        }
        match unwind_next(&ctx) {
            Some(next) => ctx = next,
            None => break,
        }
    }

    let Some(m) = matched else {
        fatal("unmatched exception", throw_ctx.rip)
    };
    log::trace!(
        "exception {exception:#x} matched clause {} in frame {}",
        m.clause_index,
        m.frame_index
    );

    // Pass 2: unwind. Run finally/fault funclets up to the matched frame,
    // then enter the handler.
    let mut ctx = throw_ctx.clone();
    for frame_index in 0..=m.frame_index {
        let Some(fi) = frame_info(&ctx) else {
            fatal("frame vanished between passes", ctx.rip)
        };
        let is_match_frame = frame_index == m.frame_index;
        let start = if frame_index == 0 {
            first_frame_clause_start
        } else {
            0
        };
        let limit = if is_match_frame {
            m.clause_index
        } else {
            fi.clauses.len()
        };
        for clause in fi.clauses.iter().take(limit).skip(start) {
            if !clause.try_contains(fi.probe) {
                continue;
            }
            if clause.kind == CLAUSE_FINALLY || clause.kind == CLAUSE_FAULT {
                let funclet = fi.image_base + clause.handler_begin as u64;
                unsafe { vela_call_funclet(funclet, exception, ctx.rbp(), &throw_ctx) };
            }
        }
        if is_match_frame {
            break;
        }
        match unwind_next(&ctx) {
            Some(next) => ctx = next,
            None => fatal("frame vanished between passes", ctx.rip),
        }
    }

    // Enter the handler. Transition frames under the abandoned stack
    // region are dead; drop them (and the world shares their runtime
    // entries held) before control can leave the dispatcher.
    let abandoned = thread.prune_transitions_below(m.establisher);
    for _ in 0..abandoned {
        rt.world_exit_shared();
    }
    thread.set_current_exception(exception);
    thread.set_active_dispatch(Some(ActiveDispatch {
        exception,
        throw_ctx: throw_ctx.clone(),
        handler_frame: m.establisher,
        handler_clause: m.clause_index,
    }));

    let handler = m.image_base + m.clause.handler_begin as u64;
    let continuation = unsafe { vela_call_funclet(handler, exception, m.establisher, &throw_ctx) };

    // The funclet returned a continuation: resume the parent method's main
    // body after its `leave`. The parent frame is intact; rebuild its
    // post-prolog stack pointer from the recorded allocation.
    thread.set_current_exception(0);
    thread.set_active_dispatch(None);
    let mut resume = throw_ctx.clone();
    resume.rip = continuation;
    resume.set_rbp(m.establisher);
    resume.set_rsp(m.establisher - m.alloc_size as u64);
    unsafe { vela_restore_context(&resume) }
}

/// Entry from the throw stub: exception in RCX, captured raise-site
/// context in RDX.
#[no_mangle]
pub extern "win64" fn vela_eh_raise_exception(exception: u64, ctx: *const Context) -> ! {
    let ctx = unsafe { &*ctx }.clone();
    dispatch(exception, ctx, 0)
}

/// Raise an exception from inside the runtime (allocation failure, cast
/// failure). The raise context is the managed frame recorded by the newest
/// transition.
pub fn raise_from_runtime(exception: u64) -> ! {
    let rt = runtime();
    let thread = rt.threads.register_current();
    let transitions = thread.transitions();
    let Some(top) = transitions.last() else {
        fatal("exception escaped to native code", 0)
    };
    dispatch(exception, context_from(top), 0)
}

/// Re-raise the in-flight exception from a handler funclet: resume the
/// search past the clause that matched.
pub fn dispatch_rethrow() -> ! {
    let rt = runtime();
    let thread = rt.threads.register_current();
    let Some(active) = thread.active_dispatch() else {
        fatal("rethrow outside a handler", 0)
    };
    // Walk the saved raise context up to the handler frame, then continue
    // searching from the clause after the one that matched.
    let mut ctx = active.throw_ctx.clone();
    let mut guard = 0;
    while ctx.rbp() != active.handler_frame {
        match unwind_next(&ctx) {
            Some(next) => ctx = next,
            None => fatal("rethrow lost its handler frame", ctx.rip),
        }
        guard += 1;
        if guard > MAX_WALK_FRAMES {
            fatal("rethrow walk did not terminate", ctx.rip);
        }
    }
    dispatch(active.exception, ctx, active.handler_clause + 1)
}

fn context_from(t: &TransitionFrame) -> Context {
    let mut ctx = Context::zeroed();
    ctx.rip = t.rip;
    ctx.set_rsp(t.rsp);
    ctx.set_rbp(t.rbp);
    ctx
}
