//! Streaming IL → x86-64 compiler
//!
//! One forward pass over the IL emits machine code, records the IL→native
//! offset map, accumulates GC safe points, and leaves label fixups that are
//! patched when targets bind. Methods with EH clauses get a second pass
//! that emits one funclet per handler (and per filter) after the main body.
//!
//! Code shape:
//! - prolog `push rbp; mov rbp, rsp; sub rsp, N`, register-argument spill
//!   into the Win64 shadow space, frame zeroing
//! - operand values live in R8–R11 or their canonical depth-addressed
//!   spill slots; everything is spilled across calls, at branches and at
//!   labels (see `stack_model`)
//! - calls marshal RCX/RDX/R8/R9 plus outgoing stack slots and are
//!   recorded as GC safe points with the live reference snapshot
//! - exception paths are inline raise blocks that enter the throw stub
//!   with a well-known exception instance

use crate::eh::{NativeEhClause, CLAUSE_FAULT, CLAUSE_FILTER, CLAUSE_FINALLY, CLAUSE_TYPED};
use crate::gc::gcinfo::{GcInfoEncoder, GcSlot, SlotBase};
use crate::jit::emit::{regs, Asm, Cc, Reg, Xmm};
use crate::jit::stack_model::{
    FrameLayout, Home, PoolState, StackEntry, ValueKind, MAX_CALL_ARGS, OUTGOING_BYTES, POOL,
};
use crate::runtime::helpers::{HelperAddrs, WellKnownException};
use crate::runtime::method_registry::{DispatchKind, MethodRegistry};
use crate::runtime::strings::StringLiteralTable;
use crate::runtime::tokens::{decode_calli_sig, FieldDesc, StaticFieldTable, TypeTokenTable};
use crate::runtime::WellKnownExceptions;
use crate::types::{MethodTableFlags, ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, MT_VTABLE_OFFSET};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use vela_il::{EhClauseKind, ExtOpcode, IlCursor, IlError, MethodBody, MethodSig, Opcode, ReturnKind};

const ARG_REGS: [Reg; 4] = [regs::RCX, regs::RDX, regs::R8, regs::R9];

#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
}

/// Compilation failures. A failed compilation taints nothing; the caller
/// simply never enters the method.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The IL stream could not be decoded.
    #[error(transparent)]
    Il(#[from] IlError),

    /// The operand-stack model underflowed (malformed IL).
    #[error("operand stack underflow at IL offset {0}")]
    StackUnderflow(u32),

    /// The operand-stack model exceeded `max_stack`.
    #[error("operand stack overflow at IL offset {0}")]
    StackOverflow(u32),

    /// A token did not resolve through the registries.
    #[error("unresolved token {0:#010x} at IL offset {1}")]
    UnresolvedToken(u32, u32),

    /// A branch targeted an offset that is not an instruction start.
    #[error("branch to invalid IL offset {0}")]
    BadBranchTarget(u32),

    /// A call site exceeded the marshalling limit.
    #[error("call with {0} arguments exceeds the limit of {MAX_CALL_ARGS}")]
    TooManyArgs(u16),

    /// An operation needed a value-type shape the compiler does not carry.
    #[error("unsupported value size {0} at IL offset {1}")]
    UnsupportedValueSize(u32, u32),

    /// A construct outside the compiled subset.
    #[error("unsupported construct at IL offset {1}: {0}")]
    Unsupported(&'static str, u32),
}

/// Registry views the compiler resolves tokens through.
pub struct CompileDeps<'a> {
    /// Method registry.
    pub methods: &'a MethodRegistry,
    /// Type tokens.
    pub types: &'a TypeTokenTable,
    /// Static-field tokens.
    pub statics: &'a StaticFieldTable,
    /// String literals.
    pub strings: &'a StringLiteralTable,
    /// Helper entrypoints.
    pub helpers: &'a HelperAddrs,
    /// Well-known exception instances for raise blocks.
    pub exceptions: &'a WellKnownExceptions,
}

/// An absolute-address fixup applied when code lands in the code heap:
/// the 8-byte field at `at` becomes `code_base + native`.
#[derive(Debug, Clone, Copy)]
pub struct AbsReloc {
    /// Byte position of the imm64 field.
    pub at: usize,
    /// Native offset the field resolves against.
    pub native: u32,
}

/// A funclet's native range and per-funclet GCInfo blob.
#[derive(Debug, Clone)]
pub struct FuncletInfo {
    /// Start offset within the method's code.
    pub begin: u32,
    /// End offset (exclusive).
    pub end: u32,
    /// GCInfo for the funclet range.
    pub gcinfo: Vec<u8>,
}

/// The output of compilation, ready to install.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    /// Emitted bytes: main body, then funclets.
    pub code: Vec<u8>,
    /// Prolog size in bytes (the unwind-described part).
    pub prolog_size: u8,
    /// The prolog's stack allocation.
    pub frame_alloc: u32,
    /// End of the main body region (funclets follow).
    pub main_end: u32,
    /// Funclet regions in emission order.
    pub funclets: Vec<FuncletInfo>,
    /// EH clauses in native offsets.
    pub native_clauses: Vec<NativeEhClause>,
    /// Main-region GCInfo blob.
    pub gcinfo: Vec<u8>,
    /// Absolute-address fixups.
    pub relocs: Vec<AbsReloc>,
    /// IL offset → native offset for every instruction start.
    pub il_map: FxHashMap<u32, u32>,
}

impl CompiledMethod {
    /// Native offset of an IL instruction start.
    pub fn native_offset(&self, il: u32) -> Option<u32> {
        self.il_map.get(&il).copied()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Main,
    Finally,
    Catch,
    Filter,
}

struct Region {
    start: usize,
    safe_points: Vec<(u32, Vec<i32>)>,
}

struct Compiler<'a> {
    deps: &'a CompileDeps<'a>,
    body: &'a MethodBody<'a>,
    sig: MethodSig,
    frame: FrameLayout,
    asm: Asm,

    stack: Vec<StackEntry>,
    pool: [PoolState; 4],

    labels: FxHashMap<u32, u32>,
    /// Main-pass positions only (instruction starts plus the positions
    /// where handler ranges were stepped over). Clause conversion reads
    /// these so a try_end that coincides with a handler start resolves to
    /// the main-body boundary, not the funclet.
    main_labels: FxHashMap<u32, u32>,
    fixups: Vec<(usize, u32)>,
    abs_il: Vec<(usize, u32)>,
    relocs: Vec<AbsReloc>,
    branch_targets: FxHashSet<u32>,
    /// handler/filter ranges skipped by the enclosing pass, start → end.
    skip_ranges: FxHashMap<u32, u32>,

    regions: Vec<Region>,
    current_region: usize,
    /// Locals that ever held a reference.
    ref_locals: FxHashSet<u16>,
    /// Operand spill slots that ever held a reference.
    ref_spills: FxHashSet<i32>,
}

/// Compile one method body.
pub fn compile(
    body: &MethodBody<'_>,
    sig: MethodSig,
    deps: &CompileDeps<'_>,
) -> Result<CompiledMethod, CompileError> {
    let local_count = sig.local_count;
    let frame = FrameLayout::new(sig.arg_count, local_count, body.max_stack.max(1));

    let mut c = Compiler {
        deps,
        body,
        sig,
        frame,
        asm: Asm::new(),
        stack: Vec::new(),
        pool: [PoolState::Free; 4],
        labels: FxHashMap::default(),
        main_labels: FxHashMap::default(),
        fixups: Vec::new(),
        abs_il: Vec::new(),
        relocs: Vec::new(),
        branch_targets: FxHashSet::default(),
        skip_ranges: FxHashMap::default(),
        regions: vec![Region {
            start: 0,
            safe_points: Vec::new(),
        }],
        current_region: 0,
        ref_locals: FxHashSet::default(),
        ref_spills: FxHashSet::default(),
    };

    c.prescan()?;
    for clause in &body.eh_clauses {
        c.skip_ranges
            .insert(clause.handler_begin, clause.handler_end);
        if clause.kind == EhClauseKind::Filter {
            c.skip_ranges
                .insert(clause.class_token_or_filter, clause.handler_begin);
        }
    }

    let prolog_size = c.emit_prolog();
    c.compile_range(0, body.il.len() as u32, RegionKind::Main)?;
    let main_end = c.asm.pos() as u32;

    // Funclet pass: one prologued region per handler, plus one per filter.
    let mut handler_ranges = vec![(0u32, 0u32); body.eh_clauses.len()];
    let mut filter_ranges = vec![(0u32, 0u32); body.eh_clauses.len()];
    for (i, clause) in body.eh_clauses.iter().enumerate() {
        match clause.kind {
            EhClauseKind::Finally | EhClauseKind::Fault => {
                handler_ranges[i] = c.compile_funclet(
                    clause.handler_begin,
                    clause.handler_end,
                    RegionKind::Finally,
                )?;
            }
            EhClauseKind::Typed => {
                handler_ranges[i] = c.compile_funclet(
                    clause.handler_begin,
                    clause.handler_end,
                    RegionKind::Catch,
                )?;
            }
            EhClauseKind::Filter => {
                filter_ranges[i] = c.compile_funclet(
                    clause.class_token_or_filter,
                    clause.handler_begin,
                    RegionKind::Filter,
                )?;
                handler_ranges[i] = c.compile_funclet(
                    clause.handler_begin,
                    clause.handler_end,
                    RegionKind::Catch,
                )?;
            }
        }
    }

    // Patch every recorded branch.
    let fixups = core::mem::take(&mut c.fixups);
    for (at, il) in fixups {
        let native = *c
            .labels
            .get(&il)
            .ok_or(CompileError::BadBranchTarget(il))?;
        c.asm.patch_rel32(at, native as usize);
    }
    let abs_il = core::mem::take(&mut c.abs_il);
    for (at, il) in abs_il {
        let native = *c
            .labels
            .get(&il)
            .ok_or(CompileError::BadBranchTarget(il))?;
        c.relocs.push(AbsReloc { at, native });
    }

    // Convert IL clauses to native offsets.
    let il_len = body.il.len() as u32;
    let resolve = |c: &Compiler<'_>, il: u32| -> Result<u32, CompileError> {
        if il >= il_len {
            return Ok(main_end);
        }
        c.main_labels
            .get(&il)
            .or_else(|| c.labels.get(&il))
            .copied()
            .ok_or(CompileError::BadBranchTarget(il))
    };
    let mut native_clauses = Vec::with_capacity(body.eh_clauses.len());
    for (i, clause) in body.eh_clauses.iter().enumerate() {
        let (kind, token_or_filter) = match clause.kind {
            EhClauseKind::Typed => (CLAUSE_TYPED, clause.class_token_or_filter),
            EhClauseKind::Filter => (CLAUSE_FILTER, filter_ranges[i].0),
            EhClauseKind::Finally => (CLAUSE_FINALLY, 0),
            EhClauseKind::Fault => (CLAUSE_FAULT, 0),
        };
        native_clauses.push(NativeEhClause {
            kind,
            try_begin: resolve(&c, clause.try_begin)?,
            try_end: resolve(&c, clause.try_end)?,
            handler_begin: handler_ranges[i].0,
            handler_end: handler_ranges[i].1,
            token_or_filter_offset: token_or_filter,
        });
    }

    let total = c.asm.pos() as u32;
    let funclet_bounds: Vec<(u32, u32)> = c.regions[1..]
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let end = c
                .regions
                .get(i + 2)
                .map_or(total, |n| n.start as u32);
            (r.start as u32, end)
        })
        .collect();

    let gcinfo = c.build_gcinfo(0, main_end);
    let funclets = funclet_bounds
        .iter()
        .enumerate()
        .map(|(i, &(begin, end))| FuncletInfo {
            begin,
            end,
            gcinfo: c.build_gcinfo(i + 1, end - begin),
        })
        .collect();

    Ok(CompiledMethod {
        code: c.asm.into_code(),
        prolog_size,
        frame_alloc: frame.alloc_size,
        main_end,
        funclets,
        native_clauses,
        gcinfo,
        relocs: c.relocs,
        il_map: c.labels,
    })
}

impl<'a> Compiler<'a> {
    // ---- operand-stack plumbing ----

    fn spill_entry(&mut self, idx: usize) {
        if let Home::Reg(p) = self.stack[idx].home {
            let off = self.frame.spill_offset(idx);
            self.asm.mov_mr(regs::RBP, off, POOL[p]);
            self.stack[idx].home = Home::Slot;
            self.pool[p] = PoolState::Free;
            if self.stack[idx].kind.is_gc_ref() {
                self.ref_spills.insert(off);
            }
        }
    }

    fn spill_all(&mut self) {
        for i in 0..self.stack.len() {
            self.spill_entry(i);
        }
        debug_assert!(self
            .pool
            .iter()
            .all(|p| !matches!(p, PoolState::Entry(_))));
    }

    fn alloc_scratch(&mut self, at: u32) -> Result<usize, CompileError> {
        if let Some(p) = self.pool.iter().position(|s| *s == PoolState::Free) {
            self.pool[p] = PoolState::Scratch;
            return Ok(p);
        }
        // Spill the oldest register-resident entry.
        let victim = (0..self.stack.len())
            .find(|&i| matches!(self.stack[i].home, Home::Reg(_)))
            .ok_or(CompileError::StackOverflow(at))?;
        let Home::Reg(p) = self.stack[victim].home else {
            unreachable!()
        };
        self.spill_entry(victim);
        self.pool[p] = PoolState::Scratch;
        Ok(p)
    }

    fn release(&mut self, p: usize) {
        debug_assert_eq!(self.pool[p], PoolState::Scratch);
        self.pool[p] = PoolState::Free;
    }

    fn push_in(&mut self, p: usize, kind: ValueKind, at: u32) -> Result<(), CompileError> {
        if self.stack.len() >= self.frame.max_stack as usize {
            return Err(CompileError::StackOverflow(at));
        }
        debug_assert_eq!(self.pool[p], PoolState::Scratch);
        self.pool[p] = PoolState::Entry(self.stack.len());
        self.stack.push(StackEntry {
            kind,
            home: Home::Reg(p),
        });
        Ok(())
    }

    fn push_fresh(&mut self, kind: ValueKind, at: u32) -> Result<usize, CompileError> {
        let p = self.alloc_scratch(at)?;
        self.push_in(p, kind, at)?;
        Ok(p)
    }

    /// Pop the top entry into a scratch register.
    fn take_top(&mut self, at: u32) -> Result<(usize, ValueKind), CompileError> {
        let entry = self.stack.pop().ok_or(CompileError::StackUnderflow(at))?;
        let depth = self.stack.len();
        match entry.home {
            Home::Reg(p) => {
                debug_assert_eq!(self.pool[p], PoolState::Entry(depth));
                self.pool[p] = PoolState::Scratch;
                Ok((p, entry.kind))
            }
            Home::Slot => {
                let p = self.alloc_scratch(at)?;
                self.asm
                    .mov_rm(POOL[p], regs::RBP, self.frame.spill_offset(depth));
                Ok((p, entry.kind))
            }
        }
    }

    fn drop_stack_to(&mut self, depth: usize) {
        while self.stack.len() > depth {
            let entry = self.stack.pop().unwrap();
            if let Home::Reg(p) = entry.home {
                self.pool[p] = PoolState::Free;
            }
        }
    }

    // ---- GC accumulation ----

    fn record_safe_point(&mut self, extra_live: &[i32]) {
        let region = &self.regions[self.current_region];
        let offset = (self.asm.pos() - region.start) as u32;
        let mut live: Vec<i32> = self
            .stack
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind.is_gc_ref())
            .map(|(i, _)| self.frame.spill_offset(i))
            .collect();
        live.extend_from_slice(extra_live);
        for &off in &live {
            self.ref_spills.insert(off);
        }
        self.regions[self.current_region]
            .safe_points
            .push((offset, live));
    }

    fn build_gcinfo(&self, region: usize, code_length: u32) -> Vec<u8> {
        let mut enc = GcInfoEncoder::new(code_length, true);
        let mut slot_ids: FxHashMap<i32, u32> = FxHashMap::default();
        let mut always_live = Vec::new();

        for i in 0..self.frame.arg_count.min(MAX_CALL_ARGS) {
            let id = enc.add_slot(GcSlot {
                base: SlotBase::CallerSp,
                offset: self.frame.arg_offset(i) - 16,
                is_interior: false,
                is_pinned: false,
            });
            always_live.push(id);
        }
        for &local in &self.ref_locals {
            let off = self.frame.local_offset(local);
            let id = enc.add_slot(GcSlot {
                base: SlotBase::FramePointer,
                offset: off,
                is_interior: false,
                is_pinned: false,
            });
            always_live.push(id);
        }
        let mut spill_offsets: Vec<i32> = self.ref_spills.iter().copied().collect();
        spill_offsets.sort_unstable();
        for off in spill_offsets {
            let id = enc.add_slot(GcSlot {
                base: SlotBase::FramePointer,
                offset: off,
                is_interior: false,
                is_pinned: false,
            });
            slot_ids.insert(off, id);
        }

        for (offset, live) in &self.regions[region].safe_points {
            let sp = enc.add_safe_point(*offset);
            for id in &always_live {
                enc.set_live(sp, *id);
            }
            for off in live {
                if let Some(id) = slot_ids.get(off) {
                    enc.set_live(sp, *id);
                }
            }
        }
        enc.finish()
    }

    // ---- prolog / epilog ----

    fn emit_prolog(&mut self) -> u8 {
        self.asm.push_r(regs::RBP);
        self.asm.mov_rr(regs::RBP, regs::RSP);
        self.asm.sub_ri(regs::RSP, self.frame.alloc_size as i32);
        let prolog_size = self.asm.pos() as u8;

        // Home the register arguments, then zero locals and spills.
        for i in 0..self.frame.arg_count.min(4) {
            self.asm
                .mov_mr(regs::RBP, self.frame.arg_offset(i), ARG_REGS[i as usize]);
        }
        self.asm.xor_rr32(regs::RAX, regs::RAX);
        for k in 0..self.frame.zeroed_slots() {
            self.asm
                .mov_mr(regs::RBP, -8 * (k as i32 + 1), regs::RAX);
        }
        prolog_size
    }

    fn emit_main_epilog(&mut self) {
        self.asm.mov_rr(regs::RSP, regs::RBP);
        self.asm.pop_r(regs::RBP);
        self.asm.ret();
    }

    /// Raise a well-known exception from this point: load the preallocated
    /// instance and enter the throw stub.
    fn emit_raise(&mut self, kind: WellKnownException) {
        let exc = self.deps.exceptions.object(kind);
        self.asm.mov_ri64(regs::RCX, exc);
        self.asm.mov_ri64(regs::RAX, self.deps.helpers.throw_stub);
        self.asm.call_r(regs::RAX);
        self.asm.int3();
    }

    /// Raise when `cc` holds, branching over the raise block otherwise.
    fn raise_if(&mut self, cc: Cc, kind: WellKnownException) {
        let skip = self.asm.jcc(cc.negate());
        self.emit_raise(kind);
        let here = self.asm.pos();
        self.asm.patch_rel32(skip, here);
    }

    // ---- calls ----

    /// Load spilled arguments into the calling convention. The top `argc`
    /// entries must already be spilled.
    fn marshal_args(&mut self, argc: u16, at: u32) -> Result<(), CompileError> {
        if argc > MAX_CALL_ARGS {
            return Err(CompileError::TooManyArgs(argc));
        }
        if (self.stack.len() as u16) < argc {
            return Err(CompileError::StackUnderflow(at));
        }
        let base = self.stack.len() - argc as usize;
        for i in 0..argc as usize {
            let off = self.frame.spill_offset(base + i);
            if i < 4 {
                self.asm.mov_rm(ARG_REGS[i], regs::RBP, off);
            } else {
                self.asm.mov_rm(regs::RAX, regs::RBP, off);
                self.asm
                    .mov_mr(regs::RSP, 0x20 + 8 * (i as i32 - 4), regs::RAX);
            }
        }
        Ok(())
    }

    fn push_call_result(&mut self, kind: ReturnKind, at: u32) -> Result<(), CompileError> {
        match kind {
            ReturnKind::Void => {}
            ReturnKind::I32 => {
                let p = self.push_fresh(ValueKind::I32, at)?;
                self.asm.movsxd_rr(POOL[p], regs::RAX);
            }
            ReturnKind::I64 => {
                let p = self.push_fresh(ValueKind::I64, at)?;
                self.asm.mov_rr(POOL[p], regs::RAX);
            }
            ReturnKind::Ref => {
                let p = self.push_fresh(ValueKind::Ref, at)?;
                self.asm.mov_rr(POOL[p], regs::RAX);
            }
            ReturnKind::Float | ReturnKind::Double => {
                let p = self.push_fresh(ValueKind::Float, at)?;
                self.asm.movq_rx(POOL[p], Xmm(0));
            }
        }
        Ok(())
    }

    /// Shared tail of every call form: truncate the consumed arguments,
    /// record the safe point, push the result.
    fn finish_call(
        &mut self,
        argc: u16,
        ret: ReturnKind,
        extra_live: &[i32],
        at: u32,
    ) -> Result<(), CompileError> {
        self.drop_stack_to(self.stack.len() - argc as usize);
        self.record_safe_point(extra_live);
        self.push_call_result(ret, at)
    }

    // ---- compilation driver ----

    fn compile_funclet(
        &mut self,
        start: u32,
        end: u32,
        kind: RegionKind,
    ) -> Result<(u32, u32), CompileError> {
        let begin = self.asm.pos();
        self.regions.push(Region {
            start: begin,
            safe_points: Vec::new(),
        });
        self.current_region = self.regions.len() - 1;

        // Fixed funclet prolog: re-establish the parent frame register
        // from RDX, then give the funclet its own outgoing area.
        self.asm.push_r(regs::RBP);
        self.asm.mov_rr(regs::RBP, regs::RDX);
        self.asm.sub_ri(regs::RSP, OUTGOING_BYTES as i32);

        self.stack.clear();
        self.pool = [PoolState::Free; 4];
        if matches!(kind, RegionKind::Catch | RegionKind::Filter) {
            // The exception object arrives in RCX; it becomes the single
            // operand-stack entry, spilled to its canonical slot.
            let off = self.frame.spill_offset(0);
            self.asm.mov_mr(regs::RBP, off, regs::RCX);
            self.ref_spills.insert(off);
            self.stack.push(StackEntry {
                kind: ValueKind::Ref,
                home: Home::Slot,
            });
        }

        self.compile_range(start, end, kind)?;

        let end_pos = self.asm.pos();
        self.current_region = 0;
        Ok((begin as u32, end_pos as u32))
    }

    fn emit_funclet_return(&mut self) {
        self.asm.add_ri(regs::RSP, OUTGOING_BYTES as i32);
        self.asm.pop_r(regs::RBP);
        self.asm.ret();
    }

    fn compile_range(
        &mut self,
        start: u32,
        end: u32,
        region: RegionKind,
    ) -> Result<(), CompileError> {
        let mut cur = IlCursor::new(self.body.il);
        cur.seek(start as usize);
        while (cur.offset() as u32) < end {
            let il_off = cur.offset() as u32;
            if il_off != start {
                // Handler (and filter) code belongs to its own funclet
                // pass; the enclosing pass steps over it.
                if let Some(&skip_end) = self.skip_ranges.get(&il_off) {
                    if self.current_region == 0 {
                        self.main_labels.insert(il_off, self.asm.pos() as u32);
                    }
                    cur.seek(skip_end as usize);
                    continue;
                }
            }
            if self.branch_targets.contains(&il_off) {
                self.spill_all();
            }
            let native = self.asm.pos();
            self.labels.insert(il_off, native as u32);
            if self.current_region == 0 {
                self.main_labels.insert(il_off, native as u32);
            }
            self.emit_instruction(&mut cur, il_off, region)?;
            if self.asm.pos() == native {
                // Every instruction start maps to a distinct native offset.
                self.asm.nop();
            }
        }
        Ok(())
    }

    fn prescan(&mut self) -> Result<(), CompileError> {
        let mut cur = IlCursor::new(self.body.il);
        while !cur.is_at_end() {
            let at = cur.offset();
            let b = cur.read_u8()?;
            if b == vela_il::opcode::EXT_PREFIX {
                let ext = ExtOpcode::decode(&mut cur)?;
                match ext {
                    ExtOpcode::LdFtn
                    | ExtOpcode::LdVirtFtn
                    | ExtOpcode::InitObj
                    | ExtOpcode::Constrained
                    | ExtOpcode::SizeOf => {
                        cur.read_u32()?;
                    }
                    ExtOpcode::LdArg
                    | ExtOpcode::LdArga
                    | ExtOpcode::StArg
                    | ExtOpcode::LdLoc
                    | ExtOpcode::LdLoca
                    | ExtOpcode::StLoc => {
                        cur.read_u16()?;
                    }
                    ExtOpcode::Unaligned => {
                        cur.read_u8()?;
                    }
                    _ => {}
                }
                continue;
            }
            let op = Opcode::from_byte(b, at)?;
            match op {
                Opcode::BrS
                | Opcode::BrFalseS
                | Opcode::BrTrueS
                | Opcode::BeqS
                | Opcode::BgeS
                | Opcode::BgtS
                | Opcode::BleS
                | Opcode::BltS
                | Opcode::BneUnS
                | Opcode::BgeUnS
                | Opcode::BgtUnS
                | Opcode::BleUnS
                | Opcode::BltUnS
                | Opcode::LeaveS => {
                    let d = cur.read_i8()? as i32;
                    self.branch_targets
                        .insert((cur.offset() as i32 + d) as u32);
                }
                Opcode::Br
                | Opcode::BrFalse
                | Opcode::BrTrue
                | Opcode::Beq
                | Opcode::Bge
                | Opcode::Bgt
                | Opcode::Ble
                | Opcode::Blt
                | Opcode::BneUn
                | Opcode::BgeUn
                | Opcode::BgtUn
                | Opcode::BleUn
                | Opcode::BltUn
                | Opcode::Leave => {
                    let d = cur.read_i32()?;
                    self.branch_targets
                        .insert((cur.offset() as i32 + d) as u32);
                }
                Opcode::Switch => {
                    let n = cur.read_u32()?;
                    let mut targets = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        targets.push(cur.read_i32()?);
                    }
                    let next = cur.offset() as i32;
                    for d in targets {
                        self.branch_targets.insert((next + d) as u32);
                    }
                }
                // Token and immediate operands.
                Opcode::LdArgS
                | Opcode::LdArgaS
                | Opcode::StArgS
                | Opcode::LdLocS
                | Opcode::LdLocaS
                | Opcode::StLocS
                | Opcode::LdcI4S => {
                    cur.read_u8()?;
                }
                Opcode::LdcI4
                | Opcode::LdcR4
                | Opcode::Jmp
                | Opcode::Call
                | Opcode::Calli
                | Opcode::CallVirt
                | Opcode::CpObj
                | Opcode::LdObj
                | Opcode::LdStr
                | Opcode::NewObj
                | Opcode::CastClass
                | Opcode::IsInst
                | Opcode::Unbox
                | Opcode::LdFld
                | Opcode::LdFlda
                | Opcode::StFld
                | Opcode::LdsFld
                | Opcode::LdsFlda
                | Opcode::StsFld
                | Opcode::StObj
                | Opcode::Box
                | Opcode::NewArr
                | Opcode::LdElema
                | Opcode::LdElem
                | Opcode::StElem
                | Opcode::UnboxAny
                | Opcode::RefAnyVal
                | Opcode::MkRefAny
                | Opcode::LdToken => {
                    cur.read_u32()?;
                }
                Opcode::LdcI8 | Opcode::LdcR8 => {
                    cur.read_u64()?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ---- instruction emission ----

    fn top_slot_offset(&self, at: u32) -> Result<i32, CompileError> {
        if self.stack.is_empty() {
            return Err(CompileError::StackUnderflow(at));
        }
        Ok(self.frame.spill_offset(self.stack.len() - 1))
    }

    #[allow(unreachable_patterns)]
    fn emit_instruction(
        &mut self,
        cur: &mut IlCursor<'_>,
        at: u32,
        region: RegionKind,
    ) -> Result<(), CompileError> {
        let b = cur.read_u8()?;
        if b == vela_il::opcode::EXT_PREFIX {
            let ext = ExtOpcode::decode(cur)?;
            return self.emit_ext(ext, cur, at, region);
        }
        let op = Opcode::from_byte(b, at as usize)?;
        match op {
            Opcode::Nop => self.asm.nop(),
            Opcode::Break => self.asm.int3(),

            // ---- arguments and locals ----
            Opcode::LdArg0 | Opcode::LdArg1 | Opcode::LdArg2 | Opcode::LdArg3 => {
                self.load_arg((b - 0x02) as u16, at)?;
            }
            Opcode::LdArgS => {
                let i = cur.read_u8()? as u16;
                self.load_arg(i, at)?;
            }
            Opcode::StArgS => {
                let i = cur.read_u8()? as u16;
                self.store_arg(i, at)?;
            }
            Opcode::LdArgaS => {
                let i = cur.read_u8()? as u16;
                let p = self.push_fresh(ValueKind::ByRef, at)?;
                self.asm.lea(POOL[p], regs::RBP, self.frame.arg_offset(i));
            }
            Opcode::LdLoc0 | Opcode::LdLoc1 | Opcode::LdLoc2 | Opcode::LdLoc3 => {
                self.load_local((b - 0x06) as u16, at)?;
            }
            Opcode::StLoc0 | Opcode::StLoc1 | Opcode::StLoc2 | Opcode::StLoc3 => {
                self.store_local((b - 0x0A) as u16, at)?;
            }
            Opcode::LdLocS => {
                let i = cur.read_u8()? as u16;
                self.load_local(i, at)?;
            }
            Opcode::StLocS => {
                let i = cur.read_u8()? as u16;
                self.store_local(i, at)?;
            }
            Opcode::LdLocaS => {
                let i = cur.read_u8()? as u16;
                let p = self.push_fresh(ValueKind::ByRef, at)?;
                self.asm.lea(POOL[p], regs::RBP, self.frame.local_offset(i));
            }

            // ---- constants ----
            Opcode::LdNull => {
                let p = self.push_fresh(ValueKind::Ref, at)?;
                self.asm.xor_rr32(POOL[p], POOL[p]);
            }
            Opcode::LdcI4M1 => self.push_i32(-1, at)?,
            Opcode::LdcI40
            | Opcode::LdcI41
            | Opcode::LdcI42
            | Opcode::LdcI43
            | Opcode::LdcI44
            | Opcode::LdcI45
            | Opcode::LdcI46
            | Opcode::LdcI47
            | Opcode::LdcI48 => self.push_i32((b - 0x16) as i32, at)?,
            Opcode::LdcI4S => {
                let v = cur.read_i8()? as i32;
                self.push_i32(v, at)?;
            }
            Opcode::LdcI4 => {
                let v = cur.read_i32()?;
                self.push_i32(v, at)?;
            }
            Opcode::LdcI8 => {
                let v = cur.read_i64()?;
                let p = self.push_fresh(ValueKind::I64, at)?;
                self.asm.mov_ri64(POOL[p], v as u64);
            }
            Opcode::LdcR4 => {
                let v = cur.read_f32()?;
                let p = self.push_fresh(ValueKind::Float, at)?;
                self.asm.mov_ri64(POOL[p], (v as f64).to_bits());
            }
            Opcode::LdcR8 => {
                let v = cur.read_f64()?;
                let p = self.push_fresh(ValueKind::Float, at)?;
                self.asm.mov_ri64(POOL[p], v.to_bits());
            }
            Opcode::LdStr => {
                let token = cur.read_u32()?;
                let p = self.push_fresh(ValueKind::Ref, at)?;
                match self.deps.strings.resolve(token) {
                    Some(addr) => self.asm.mov_ri64(POOL[p], addr),
                    None => self.asm.xor_rr32(POOL[p], POOL[p]),
                }
            }

            // ---- stack ----
            Opcode::Dup => {
                let (src, kind) = self.take_top(at)?;
                self.push_in(src, kind, at)?;
                let p = self.push_fresh(kind, at)?;
                self.asm.mov_rr(POOL[p], POOL[src]);
            }
            Opcode::Pop => {
                let (p, _) = self.take_top(at)?;
                self.release(p);
            }

            // ---- arithmetic ----
            Opcode::Add => self.binary_arith(at, ArithOp::Add)?,
            Opcode::Sub => self.binary_arith(at, ArithOp::Sub)?,
            Opcode::Mul => self.binary_arith(at, ArithOp::Mul)?,
            Opcode::And => self.binary_int64(at, Asm::and_rr)?,
            Opcode::Or => self.binary_int64(at, Asm::or_rr)?,
            Opcode::Xor => self.binary_int64(at, Asm::xor_rr)?,
            Opcode::Div => self.emit_div(at, true, true)?,
            Opcode::DivUn => self.emit_div(at, false, true)?,
            Opcode::Rem => self.emit_div(at, true, false)?,
            Opcode::RemUn => self.emit_div(at, false, false)?,
            Opcode::Shl => self.emit_shift(at, 0)?,
            Opcode::Shr => self.emit_shift(at, 2)?,
            Opcode::ShrUn => self.emit_shift(at, 1)?,
            Opcode::Neg => {
                let (p, kind) = self.take_top(at)?;
                if kind == ValueKind::Float {
                    let m = self.alloc_scratch(at)?;
                    self.asm.mov_ri64(POOL[m], 0x8000_0000_0000_0000);
                    self.asm.xor_rr(POOL[p], POOL[m]);
                    self.release(m);
                } else {
                    self.asm.neg_r(POOL[p], true);
                }
                self.push_in(p, kind, at)?;
            }
            Opcode::Not => {
                let (p, kind) = self.take_top(at)?;
                self.asm.not_r(POOL[p], true);
                self.push_in(p, kind, at)?;
            }

            // ---- overflow arithmetic ----
            Opcode::AddOvf => self.binary_ovf(at, true, |a, d, s, w| {
                if w {
                    a.add_rr(d, s)
                } else {
                    a.add_rr32(d, s)
                }
            })?,
            Opcode::AddOvfUn => self.binary_ovf(at, false, |a, d, s, w| {
                if w {
                    a.add_rr(d, s)
                } else {
                    a.add_rr32(d, s)
                }
            })?,
            Opcode::SubOvf => self.binary_ovf(at, true, |a, d, s, w| {
                if w {
                    a.sub_rr(d, s)
                } else {
                    a.sub_rr32(d, s)
                }
            })?,
            Opcode::SubOvfUn => self.binary_ovf(at, false, |a, d, s, w| {
                if w {
                    a.sub_rr(d, s)
                } else {
                    a.sub_rr32(d, s)
                }
            })?,
            Opcode::MulOvf => self.binary_ovf(at, true, |a, d, s, w| {
                if w {
                    a.imul_rr(d, s)
                } else {
                    a.imul_rr32(d, s)
                }
            })?,
            Opcode::MulOvfUn => self.binary_ovf(at, true, |a, d, s, w| {
                if w {
                    a.imul_rr(d, s)
                } else {
                    a.imul_rr32(d, s)
                }
            })?,

            // ---- conversions ----
            Opcode::ConvI1 => self.conv_small(at, 0)?,
            Opcode::ConvU1 => self.conv_small(at, 1)?,
            Opcode::ConvI2 => self.conv_small(at, 2)?,
            Opcode::ConvU2 => self.conv_small(at, 3)?,
            Opcode::ConvI4 => self.conv_small(at, 4)?,
            Opcode::ConvU4 => self.conv_small(at, 5)?,
            Opcode::ConvI8 | Opcode::ConvI => self.conv_to_i64(at, true)?,
            Opcode::ConvU8 | Opcode::ConvU => self.conv_to_i64(at, false)?,
            Opcode::ConvR4 => {
                let (p, kind) = self.take_top(at)?;
                if kind == ValueKind::Float {
                    self.asm.movq_xr(Xmm(0), POOL[p]);
                } else {
                    self.asm.cvtsi2sd(Xmm(0), POOL[p]);
                }
                self.asm.cvtsd2ss(Xmm(0), Xmm(0));
                self.asm.cvtss2sd(Xmm(0), Xmm(0));
                self.asm.movq_rx(POOL[p], Xmm(0));
                self.push_in(p, ValueKind::Float, at)?;
            }
            Opcode::ConvR8 | Opcode::ConvRUn => {
                let (p, kind) = self.take_top(at)?;
                if kind != ValueKind::Float {
                    self.asm.cvtsi2sd(Xmm(0), POOL[p]);
                    self.asm.movq_rx(POOL[p], Xmm(0));
                }
                self.push_in(p, ValueKind::Float, at)?;
            }

            // ---- overflow conversions ----
            Opcode::ConvOvfI1 | Opcode::ConvOvfI1Un => self.conv_ovf(at, -128, 127, 4)?,
            Opcode::ConvOvfU1 | Opcode::ConvOvfU1Un => self.conv_ovf(at, 0, 255, 4)?,
            Opcode::ConvOvfI2 | Opcode::ConvOvfI2Un => self.conv_ovf(at, -32768, 32767, 4)?,
            Opcode::ConvOvfU2 | Opcode::ConvOvfU2Un => self.conv_ovf(at, 0, 65535, 4)?,
            Opcode::ConvOvfI4 | Opcode::ConvOvfI4Un => {
                self.conv_ovf(at, i32::MIN as i64, i32::MAX as i64, 4)?
            }
            Opcode::ConvOvfU4 | Opcode::ConvOvfU4Un => {
                self.conv_ovf(at, 0, u32::MAX as i64, 4)?
            }
            Opcode::ConvOvfI8 | Opcode::ConvOvfI | Opcode::ConvOvfI8Un | Opcode::ConvOvfIUn => {
                // Identity on the 64-bit model; negative-to-unsigned source
                // mismatches are not observable through it.
                let (p, _) = self.take_top(at)?;
                self.push_in(p, ValueKind::I64, at)?;
            }
            Opcode::ConvOvfU8 | Opcode::ConvOvfU | Opcode::ConvOvfU8Un | Opcode::ConvOvfUUn => {
                let (p, _) = self.take_top(at)?;
                self.asm.test_rr(POOL[p], POOL[p]);
                self.raise_if(Cc::S, WellKnownException::Overflow);
                self.push_in(p, ValueKind::I64, at)?;
            }
            Opcode::CkFinite => {
                let (p, _) = self.take_top(at)?;
                let m = self.alloc_scratch(at)?;
                self.asm.mov_ri64(POOL[m], 0x7FF0_0000_0000_0000);
                self.asm.mov_rr(regs::RAX, POOL[p]);
                self.asm.and_rr(regs::RAX, POOL[m]);
                self.asm.cmp_rr(regs::RAX, POOL[m]);
                self.release(m);
                self.raise_if(Cc::E, WellKnownException::Overflow);
                self.push_in(p, ValueKind::Float, at)?;
            }

            // ---- branches ----
            Opcode::Br | Opcode::BrS => {
                let target = self.read_branch_target(cur, op == Opcode::BrS)?;
                self.spill_all();
                let fix = self.asm.jmp();
                self.fixups.push((fix, target));
            }
            Opcode::BrTrue | Opcode::BrTrueS => {
                let target = self.read_branch_target(cur, op == Opcode::BrTrueS)?;
                self.branch_on_truth(target, Cc::Ne, at)?;
            }
            Opcode::BrFalse | Opcode::BrFalseS => {
                let target = self.read_branch_target(cur, op == Opcode::BrFalseS)?;
                self.branch_on_truth(target, Cc::E, at)?;
            }
            Opcode::Beq | Opcode::BeqS => self.branch_cmp(cur, op == Opcode::BeqS, Cc::E, at)?,
            Opcode::BneUn | Opcode::BneUnS => {
                self.branch_cmp(cur, op == Opcode::BneUnS, Cc::Ne, at)?
            }
            Opcode::Bge | Opcode::BgeS => self.branch_cmp(cur, op == Opcode::BgeS, Cc::Ge, at)?,
            Opcode::Bgt | Opcode::BgtS => self.branch_cmp(cur, op == Opcode::BgtS, Cc::G, at)?,
            Opcode::Ble | Opcode::BleS => self.branch_cmp(cur, op == Opcode::BleS, Cc::Le, at)?,
            Opcode::Blt | Opcode::BltS => self.branch_cmp(cur, op == Opcode::BltS, Cc::L, at)?,
            Opcode::BgeUn | Opcode::BgeUnS => {
                self.branch_cmp(cur, op == Opcode::BgeUnS, Cc::Ae, at)?
            }
            Opcode::BgtUn | Opcode::BgtUnS => {
                self.branch_cmp(cur, op == Opcode::BgtUnS, Cc::A, at)?
            }
            Opcode::BleUn | Opcode::BleUnS => {
                self.branch_cmp(cur, op == Opcode::BleUnS, Cc::Be, at)?
            }
            Opcode::BltUn | Opcode::BltUnS => {
                self.branch_cmp(cur, op == Opcode::BltUnS, Cc::B, at)?
            }
            Opcode::Switch => self.emit_switch(cur, at)?,

            // ---- indirect loads/stores ----
            Opcode::LdIndI1 => self.ldind(at, 1, true, ValueKind::I32)?,
            Opcode::LdIndU1 => self.ldind(at, 1, false, ValueKind::I32)?,
            Opcode::LdIndI2 => self.ldind(at, 2, true, ValueKind::I32)?,
            Opcode::LdIndU2 => self.ldind(at, 2, false, ValueKind::I32)?,
            Opcode::LdIndI4 => self.ldind(at, 4, true, ValueKind::I32)?,
            Opcode::LdIndU4 => self.ldind(at, 4, false, ValueKind::I32)?,
            Opcode::LdIndI8 | Opcode::LdIndI => self.ldind(at, 8, true, ValueKind::I64)?,
            Opcode::LdIndR4 => {
                // Load f32 bits and widen to the canonical f64 form.
                let (addr, _) = self.take_top(at)?;
                self.asm.mov_rm32(POOL[addr], POOL[addr], 0);
                self.asm.movq_xr(Xmm(0), POOL[addr]);
                self.asm.cvtss2sd(Xmm(0), Xmm(0));
                self.asm.movq_rx(POOL[addr], Xmm(0));
                self.push_in(addr, ValueKind::Float, at)?;
            }
            Opcode::LdIndR8 => self.ldind(at, 8, true, ValueKind::Float)?,
            Opcode::LdIndRef => self.ldind(at, 8, true, ValueKind::Ref)?,
            Opcode::StIndI1 => self.stind(at, 1)?,
            Opcode::StIndI2 => self.stind(at, 2)?,
            Opcode::StIndI4 => self.stind(at, 4)?,
            Opcode::StIndI8 | Opcode::StIndI | Opcode::StIndRef => self.stind(at, 8)?,
            Opcode::StIndR4 => {
                let (val, _) = self.take_top(at)?;
                let (addr, _) = self.take_top(at)?;
                self.asm.movq_xr(Xmm(0), POOL[val]);
                self.asm.cvtsd2ss(Xmm(0), Xmm(0));
                self.asm.movq_rx(regs::RAX, Xmm(0));
                self.asm.mov_mr32(POOL[addr], 0, regs::RAX);
                self.release(val);
                self.release(addr);
            }
            Opcode::StIndR8 => self.stind(at, 8)?,

            // ---- object model ----
            Opcode::LdFld => {
                let desc = FieldDesc::decode(cur.read_u32()?);
                let (obj, _) = self.take_top(at)?;
                self.asm.test_rr(POOL[obj], POOL[obj]);
                self.raise_if(Cc::E, WellKnownException::NullReference);
                self.load_sized(POOL[obj], POOL[obj], desc.offset as i32, desc.size, desc.signed);
                let kind = if desc.is_ref {
                    ValueKind::Ref
                } else if desc.size == 8 {
                    ValueKind::I64
                } else {
                    ValueKind::I32
                };
                self.push_in(obj, kind, at)?;
            }
            Opcode::LdFlda => {
                let desc = FieldDesc::decode(cur.read_u32()?);
                let (obj, _) = self.take_top(at)?;
                self.asm.test_rr(POOL[obj], POOL[obj]);
                self.raise_if(Cc::E, WellKnownException::NullReference);
                self.asm.lea(POOL[obj], POOL[obj], desc.offset as i32);
                self.push_in(obj, ValueKind::ByRef, at)?;
            }
            Opcode::StFld => {
                let desc = FieldDesc::decode(cur.read_u32()?);
                let (val, _) = self.take_top(at)?;
                let (obj, _) = self.take_top(at)?;
                self.asm.test_rr(POOL[obj], POOL[obj]);
                self.raise_if(Cc::E, WellKnownException::NullReference);
                self.store_sized(POOL[obj], desc.offset as i32, POOL[val], desc.size);
                self.release(val);
                self.release(obj);
            }
            Opcode::LdsFld => {
                let field = self.deps.statics.resolve(cur.read_u32()?);
                let p = self.push_fresh(
                    if field.is_ref {
                        ValueKind::Ref
                    } else if field.size == 8 {
                        ValueKind::I64
                    } else {
                        ValueKind::I32
                    },
                    at,
                )?;
                self.asm.mov_ri64(POOL[p], field.addr);
                self.load_sized(POOL[p], POOL[p], 0, field.size, field.signed);
            }
            Opcode::LdsFlda => {
                let field = self.deps.statics.resolve(cur.read_u32()?);
                let p = self.push_fresh(ValueKind::ByRef, at)?;
                self.asm.mov_ri64(POOL[p], field.addr);
            }
            Opcode::StsFld => {
                let field = self.deps.statics.resolve(cur.read_u32()?);
                let (val, _) = self.take_top(at)?;
                let addr = self.alloc_scratch(at)?;
                self.asm.mov_ri64(POOL[addr], field.addr);
                self.store_sized(POOL[addr], 0, POOL[val], field.size);
                self.release(addr);
                self.release(val);
            }

            Opcode::LdLen => {
                let (arr, _) = self.take_top(at)?;
                self.asm.test_rr(POOL[arr], POOL[arr]);
                self.raise_if(Cc::E, WellKnownException::NullReference);
                self.asm
                    .mov_rm(POOL[arr], POOL[arr], ARRAY_LENGTH_OFFSET as i32);
                self.push_in(arr, ValueKind::I64, at)?;
            }
            Opcode::LdElemI1 => self.ldelem(at, 1, true, ValueKind::I32)?,
            Opcode::LdElemU1 => self.ldelem(at, 1, false, ValueKind::I32)?,
            Opcode::LdElemI2 => self.ldelem(at, 2, true, ValueKind::I32)?,
            Opcode::LdElemU2 => self.ldelem(at, 2, false, ValueKind::I32)?,
            Opcode::LdElemI4 => self.ldelem(at, 4, true, ValueKind::I32)?,
            Opcode::LdElemU4 => self.ldelem(at, 4, false, ValueKind::I32)?,
            Opcode::LdElemI8 | Opcode::LdElemI => self.ldelem(at, 8, true, ValueKind::I64)?,
            Opcode::LdElemR8 => self.ldelem(at, 8, true, ValueKind::Float)?,
            Opcode::LdElemR4 => {
                let addr = self.element_address(at, 4)?;
                self.asm.mov_rm32(POOL[addr], POOL[addr], 0);
                self.asm.movq_xr(Xmm(0), POOL[addr]);
                self.asm.cvtss2sd(Xmm(0), Xmm(0));
                self.asm.movq_rx(POOL[addr], Xmm(0));
                self.push_in(addr, ValueKind::Float, at)?;
            }
            Opcode::LdElemRef => self.ldelem(at, 8, true, ValueKind::Ref)?,
            Opcode::LdElem => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                let size = element_size(mt);
                match size {
                    1 | 2 | 4 | 8 => {
                        let kind = if mt.is_reference_type() {
                            ValueKind::Ref
                        } else if size == 8 {
                            ValueKind::I64
                        } else {
                            ValueKind::I32
                        };
                        self.ldelem(at, size as u8, true, kind)?
                    }
                    n => return Err(CompileError::UnsupportedValueSize(n as u32, at)),
                }
            }
            Opcode::StElemI1 => self.stelem(at, 1)?,
            Opcode::StElemI2 => self.stelem(at, 2)?,
            Opcode::StElemI4 => self.stelem(at, 4)?,
            Opcode::StElemI8 | Opcode::StElemI => self.stelem(at, 8)?,
            Opcode::StElemR4 => {
                let (val, _) = self.take_top(at)?;
                let addr = self.element_address(at, 4)?;
                self.asm.movq_xr(Xmm(0), POOL[val]);
                self.asm.cvtsd2ss(Xmm(0), Xmm(0));
                self.asm.movq_rx(regs::RAX, Xmm(0));
                self.asm.mov_mr32(POOL[addr], 0, regs::RAX);
                self.release(val);
                self.release(addr);
            }
            Opcode::StElemR8 => self.stelem(at, 8)?,
            Opcode::StElemRef => {
                // Covariance-checked store through the runtime.
                self.spill_all();
                self.marshal_args(3, at)?;
                self.asm.mov_ri64(regs::RAX, self.deps.helpers.stelem_ref);
                self.asm.call_r(regs::RAX);
                self.finish_call(3, ReturnKind::Void, &[], at)?;
            }
            Opcode::StElem => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                let size = element_size(mt);
                match size {
                    1 | 2 | 4 | 8 => self.stelem(at, size as u8)?,
                    n => return Err(CompileError::UnsupportedValueSize(n as u32, at)),
                }
            }
            Opcode::LdElema => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                let size = element_size(mt);
                match size {
                    1 | 2 | 4 | 8 => {
                        let addr = self.element_address(at, size as u8)?;
                        self.push_in(addr, ValueKind::ByRef, at)?;
                    }
                    n => return Err(CompileError::UnsupportedValueSize(n as u32, at)),
                }
            }

            Opcode::NewArr => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                self.spill_all();
                // rcx = element MT, rdx = count.
                let top = self.top_slot_offset(at)?;
                self.asm.mov_rm(regs::RDX, regs::RBP, top);
                self.asm.mov_ri64(regs::RCX, mt.addr());
                self.asm.mov_ri64(regs::RAX, self.deps.helpers.new_array);
                self.asm.call_r(regs::RAX);
                self.finish_call(1, ReturnKind::Ref, &[], at)?;
            }
            Opcode::NewObj => {
                let token = cur.read_u32()?;
                self.emit_newobj(token, at)?;
            }
            Opcode::IsInst | Opcode::CastClass => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                let helper = if op == Opcode::IsInst {
                    self.deps.helpers.isinst
                } else {
                    self.deps.helpers.castclass
                };
                self.spill_all();
                let top = self.top_slot_offset(at)?;
                self.asm.mov_rm(regs::RCX, regs::RBP, top);
                self.asm.mov_ri64(regs::RDX, mt.addr());
                self.asm.mov_ri64(regs::RAX, helper);
                self.asm.call_r(regs::RAX);
                self.finish_call(1, ReturnKind::Ref, &[], at)?;
            }
            Opcode::Box => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                if mt.is_reference_type() {
                    // Boxing a reference type is the identity.
                    let (p, _) = self.take_top(at)?;
                    self.push_in(p, ValueKind::Ref, at)?;
                } else {
                    self.spill_all();
                    let top = self.top_slot_offset(at)?;
                    self.asm.mov_rm(regs::RDX, regs::RBP, top);
                    self.asm.mov_ri64(regs::RCX, mt.addr());
                    self.asm.mov_ri64(regs::RAX, self.deps.helpers.box_value);
                    self.asm.call_r(regs::RAX);
                    self.finish_call(1, ReturnKind::Ref, &[], at)?;
                }
            }
            Opcode::Unbox => {
                let token = cur.read_u32()?;
                self.emit_unbox(token, at)?;
            }
            Opcode::UnboxAny => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                if mt.is_reference_type() {
                    // unbox.any of a reference type is castclass.
                    self.spill_all();
                    let top = self.top_slot_offset(at)?;
                    self.asm.mov_rm(regs::RCX, regs::RBP, top);
                    self.asm.mov_ri64(regs::RDX, mt.addr());
                    self.asm.mov_ri64(regs::RAX, self.deps.helpers.castclass);
                    self.asm.call_r(regs::RAX);
                    self.finish_call(1, ReturnKind::Ref, &[], at)?;
                } else {
                    self.emit_unbox(token, at)?;
                    let vt_size = element_size(mt);
                    match vt_size {
                        1 | 2 | 4 | 8 => {
                            let (addr, _) = self.take_top(at)?;
                            self.load_sized(POOL[addr], POOL[addr], 0, vt_size as u8, true);
                            let kind = if vt_size == 8 {
                                ValueKind::I64
                            } else {
                                ValueKind::I32
                            };
                            self.push_in(addr, kind, at)?;
                        }
                        n => return Err(CompileError::UnsupportedValueSize(n as u32, at)),
                    }
                }
            }
            Opcode::LdObj => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                let size = element_size(mt);
                match size {
                    1 | 2 | 4 | 8 => {
                        let (addr, _) = self.take_top(at)?;
                        self.load_sized(POOL[addr], POOL[addr], 0, size as u8, true);
                        let kind = if size == 8 { ValueKind::I64 } else { ValueKind::I32 };
                        self.push_in(addr, kind, at)?;
                    }
                    n => return Err(CompileError::UnsupportedValueSize(n as u32, at)),
                }
            }
            Opcode::StObj => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                let size = element_size(mt);
                match size {
                    1 | 2 | 4 | 8 => {
                        let (val, _) = self.take_top(at)?;
                        let (addr, _) = self.take_top(at)?;
                        self.store_sized(POOL[addr], 0, POOL[val], size as u8);
                        self.release(val);
                        self.release(addr);
                    }
                    n => return Err(CompileError::UnsupportedValueSize(n as u32, at)),
                }
            }
            Opcode::CpObj => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                let size = element_size(mt) as i32;
                let (src, _) = self.take_top(at)?;
                let (dst, _) = self.take_top(at)?;
                self.emit_block_copy(POOL[dst], POOL[src], None, size);
                self.release(src);
                self.release(dst);
            }
            Opcode::Throw => {
                self.spill_all();
                let top = self.top_slot_offset(at)?;
                self.asm.mov_rm(regs::RCX, regs::RBP, top);
                self.drop_stack_to(self.stack.len() - 1);
                self.asm.mov_ri64(regs::RAX, self.deps.helpers.throw_stub);
                self.asm.call_r(regs::RAX);
                self.asm.int3();
                self.stack.clear();
            }

            // ---- calls and returns ----
            Opcode::Call => {
                let token = cur.read_u32()?;
                self.emit_call(token, at)?;
            }
            Opcode::CallVirt => {
                let token = cur.read_u32()?;
                self.emit_callvirt(token, at)?;
            }
            Opcode::Calli => {
                let token = cur.read_u32()?;
                let (ret, argc) = decode_calli_sig(token);
                self.spill_all();
                // The function pointer is on top, above the arguments.
                let fnptr_off = self.top_slot_offset(at)?;
                self.drop_stack_to(self.stack.len() - 1);
                self.marshal_args(argc as u16, at)?;
                self.asm.mov_rm(regs::RAX, regs::RBP, fnptr_off);
                self.asm.call_r(regs::RAX);
                self.finish_call(argc as u16, ret, &[], at)?;
            }
            Opcode::Jmp => {
                let token = cur.read_u32()?;
                let entry = self
                    .deps
                    .methods
                    .get(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                // Reload the argument registers from their homes, tear the
                // frame down, and tail-dispatch. Stack arguments stay put:
                // the target sees this frame's caller.
                for i in 0..entry.arg_count.min(4) {
                    self.asm
                        .mov_rm(ARG_REGS[i as usize], regs::RBP, self.frame.arg_offset(i));
                }
                self.asm.mov_ri64(regs::RAX, entry.entrypoint);
                self.asm.mov_rr(regs::RSP, regs::RBP);
                self.asm.pop_r(regs::RBP);
                self.asm.jmp_r(regs::RAX);
                self.stack.clear();
            }
            Opcode::Ret => match region {
                RegionKind::Main => {
                    if self.sig.return_kind != ReturnKind::Void {
                        let (p, kind) = self.take_top(at)?;
                        if kind == ValueKind::Float {
                            self.asm.movq_xr(Xmm(0), POOL[p]);
                        } else {
                            self.asm.mov_rr(regs::RAX, POOL[p]);
                        }
                        self.release(p);
                    }
                    self.emit_main_epilog();
                    self.stack.clear();
                    self.pool = [PoolState::Free; 4];
                }
                _ => {
                    // Return from the parent method out of a handler: the
                    // funclet's frame register is the parent frame, so the
                    // pivot epilog unwinds straight to the parent's caller.
                    if self.sig.return_kind != ReturnKind::Void {
                        let (p, kind) = self.take_top(at)?;
                        if kind == ValueKind::Float {
                            self.asm.movq_xr(Xmm(0), POOL[p]);
                        } else {
                            self.asm.mov_rr(regs::RAX, POOL[p]);
                        }
                        self.release(p);
                    }
                    self.asm.mov_rr(regs::RSP, regs::RBP);
                    self.asm.pop_r(regs::RBP);
                    self.asm.ret();
                    self.stack.clear();
                    self.pool = [PoolState::Free; 4];
                }
            },

            // ---- EH control flow ----
            Opcode::Leave | Opcode::LeaveS => {
                let target = self.read_branch_target(cur, op == Opcode::LeaveS)?;
                self.emit_leave(target, at, region)?;
            }
            Opcode::EndFinally => {
                self.stack.clear();
                self.pool = [PoolState::Free; 4];
                self.emit_funclet_return();
            }

            Opcode::LdToken => {
                let token = cur.read_u32()?;
                let value = self
                    .deps
                    .types
                    .resolve(token)
                    .map(|mt| mt.addr())
                    .unwrap_or(token as u64);
                let p = self.push_fresh(ValueKind::I64, at)?;
                self.asm.mov_ri64(POOL[p], value);
            }
            Opcode::MkRefAny => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                let (ptr, _) = self.take_top(at)?;
                self.asm
                    .mov_mr(regs::RBP, self.frame.typedref_offset(0), POOL[ptr]);
                self.asm.mov_ri64(POOL[ptr], mt.addr());
                self.asm
                    .mov_mr(regs::RBP, self.frame.typedref_offset(1), POOL[ptr]);
                self.asm
                    .lea(POOL[ptr], regs::RBP, self.frame.typedref_offset(0));
                self.push_in(ptr, ValueKind::ByRef, at)?;
            }
            Opcode::RefAnyVal => {
                let _token = cur.read_u32()?;
                let (tr, _) = self.take_top(at)?;
                self.asm.mov_rm(POOL[tr], POOL[tr], 0);
                self.push_in(tr, ValueKind::ByRef, at)?;
            }

            other => {
                log::trace!("unsupported opcode {other:?} at IL offset {at}");
                return Err(CompileError::Unsupported(
                    "primary opcode outside the compiled subset",
                    at,
                ));
            }
        }
        Ok(())
    }

    fn emit_ext(
        &mut self,
        ext: ExtOpcode,
        cur: &mut IlCursor<'_>,
        at: u32,
        region: RegionKind,
    ) -> Result<(), CompileError> {
        match ext {
            ExtOpcode::Ceq => self.emit_compare(at, Cc::E)?,
            ExtOpcode::Cgt => self.emit_compare(at, Cc::G)?,
            ExtOpcode::CgtUn => self.emit_compare(at, Cc::A)?,
            ExtOpcode::Clt => self.emit_compare(at, Cc::L)?,
            ExtOpcode::CltUn => self.emit_compare(at, Cc::B)?,

            ExtOpcode::LdArg => {
                let i = cur.read_u16()?;
                self.load_arg(i, at)?;
            }
            ExtOpcode::StArg => {
                let i = cur.read_u16()?;
                self.store_arg(i, at)?;
            }
            ExtOpcode::LdArga => {
                let i = cur.read_u16()?;
                let p = self.push_fresh(ValueKind::ByRef, at)?;
                self.asm.lea(POOL[p], regs::RBP, self.frame.arg_offset(i));
            }
            ExtOpcode::LdLoc => {
                let i = cur.read_u16()?;
                self.load_local(i, at)?;
            }
            ExtOpcode::StLoc => {
                let i = cur.read_u16()?;
                self.store_local(i, at)?;
            }
            ExtOpcode::LdLoca => {
                let i = cur.read_u16()?;
                let p = self.push_fresh(ValueKind::ByRef, at)?;
                self.asm.lea(POOL[p], regs::RBP, self.frame.local_offset(i));
            }

            ExtOpcode::LdFtn => {
                let token = cur.read_u32()?;
                let entry = self
                    .deps
                    .methods
                    .get(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                let p = self.push_fresh(ValueKind::I64, at)?;
                self.asm.mov_ri64(POOL[p], entry.entrypoint);
            }
            ExtOpcode::LdVirtFtn => {
                let token = cur.read_u32()?;
                self.spill_all();
                let top = self.top_slot_offset(at)?;
                self.asm.mov_rm(regs::RCX, regs::RBP, top);
                self.asm.mov_ri64(regs::RDX, token as u64);
                self.asm.mov_ri64(regs::RAX, self.deps.helpers.ldvirtftn);
                self.asm.call_r(regs::RAX);
                self.finish_call(1, ReturnKind::I64, &[], at)?;
            }

            ExtOpcode::LocAlloc => {
                let (size, _) = self.take_top(at)?;
                self.asm.add_ri(POOL[size], 15);
                self.asm.and_ri(POOL[size], -16);
                self.asm.sub_rr(regs::RSP, POOL[size]);
                self.asm
                    .lea(POOL[size], regs::RSP, OUTGOING_BYTES as i32);
                self.push_in(size, ValueKind::ByRef, at)?;
            }

            ExtOpcode::InitObj => {
                let token = cur.read_u32()?;
                let mt = self
                    .deps
                    .types
                    .resolve(token)
                    .ok_or(CompileError::UnresolvedToken(token, at))?;
                let size = element_size(mt) as i32;
                let (addr, _) = self.take_top(at)?;
                self.emit_block_zero(POOL[addr], size);
                self.release(addr);
            }
            ExtOpcode::CpBlk => {
                let (len, _) = self.take_top(at)?;
                let (src, _) = self.take_top(at)?;
                let (dst, _) = self.take_top(at)?;
                self.emit_block_copy(POOL[dst], POOL[src], Some(POOL[len]), 0);
                self.release(len);
                self.release(src);
                self.release(dst);
            }
            ExtOpcode::InitBlk => {
                let (len, _) = self.take_top(at)?;
                let (val, _) = self.take_top(at)?;
                let (addr, _) = self.take_top(at)?;
                // rep stosb fills from AL; RDI is callee-saved, so save it
                // around the sequence. The frame register keeps unwind and
                // slot addressing valid across the pushes.
                self.asm.push_r(regs::RDI);
                self.asm.mov_rr(regs::RDI, POOL[addr]);
                self.asm.mov_rr(regs::RAX, POOL[val]);
                self.asm.mov_rr(regs::RCX, POOL[len]);
                self.asm.rep_stosb();
                self.asm.pop_r(regs::RDI);
                self.release(len);
                self.release(val);
                self.release(addr);
            }

            ExtOpcode::Rethrow => {
                if !matches!(region, RegionKind::Catch | RegionKind::Filter) {
                    return Err(CompileError::Unsupported("rethrow outside a handler", at));
                }
                self.asm.mov_ri64(regs::RAX, self.deps.helpers.rethrow);
                self.asm.call_r(regs::RAX);
                self.asm.int3();
            }
            ExtOpcode::EndFilter => {
                let (v, _) = self.take_top(at)?;
                self.asm.mov_rr(regs::RAX, POOL[v]);
                self.release(v);
                self.stack.clear();
                self.pool = [PoolState::Free; 4];
                self.emit_funclet_return();
            }

            ExtOpcode::SizeOf => {
                let token = cur.read_u32()?;
                let size = match self.deps.types.resolve(token) {
                    Some(mt) if !mt.is_reference_type() => element_size(mt),
                    _ => 8,
                };
                self.push_i32(size as i32, at)?;
            }
            ExtOpcode::RefAnyType => {
                let (tr, _) = self.take_top(at)?;
                self.asm.mov_rm(POOL[tr], POOL[tr], 8);
                self.push_in(tr, ValueKind::I64, at)?;
            }
            ExtOpcode::ArgList => {
                // No vararg support: an empty handle.
                let p = self.push_fresh(ValueKind::I64, at)?;
                self.asm.xor_rr32(POOL[p], POOL[p]);
            }

            // Decode-only prefixes.
            ExtOpcode::Unaligned => {
                cur.read_u8()?;
            }
            ExtOpcode::Volatile | ExtOpcode::Tail | ExtOpcode::Readonly => {}
            ExtOpcode::Constrained => {
                cur.read_u32()?;
            }
        }
        Ok(())
    }

    // ---- shared emission pieces ----

    fn push_i32(&mut self, v: i32, at: u32) -> Result<(), CompileError> {
        let p = self.push_fresh(ValueKind::I32, at)?;
        self.asm.mov_ri32(POOL[p], v);
        Ok(())
    }

    fn load_arg(&mut self, i: u16, at: u32) -> Result<(), CompileError> {
        let p = self.push_fresh(ValueKind::I64, at)?;
        self.asm.mov_rm(POOL[p], regs::RBP, self.frame.arg_offset(i));
        Ok(())
    }

    fn store_arg(&mut self, i: u16, at: u32) -> Result<(), CompileError> {
        let (p, _) = self.take_top(at)?;
        self.asm.mov_mr(regs::RBP, self.frame.arg_offset(i), POOL[p]);
        self.release(p);
        Ok(())
    }

    fn load_local(&mut self, i: u16, at: u32) -> Result<(), CompileError> {
        let kind = if self.ref_locals.contains(&i) {
            ValueKind::Ref
        } else {
            ValueKind::I64
        };
        let p = self.push_fresh(kind, at)?;
        self.asm
            .mov_rm(POOL[p], regs::RBP, self.frame.local_offset(i));
        Ok(())
    }

    fn store_local(&mut self, i: u16, at: u32) -> Result<(), CompileError> {
        let (p, kind) = self.take_top(at)?;
        if kind.is_gc_ref() {
            self.ref_locals.insert(i);
        }
        self.asm
            .mov_mr(regs::RBP, self.frame.local_offset(i), POOL[p]);
        self.release(p);
        Ok(())
    }

    fn load_sized(&mut self, dst: Reg, base: Reg, disp: i32, size: u8, signed: bool) {
        match (size, signed) {
            (1, true) => self.asm.movsx_rm8(dst, base, disp),
            (1, false) => self.asm.movzx_rm8(dst, base, disp),
            (2, true) => self.asm.movsx_rm16(dst, base, disp),
            (2, false) => self.asm.movzx_rm16(dst, base, disp),
            (4, true) => self.asm.movsxd_rm32(dst, base, disp),
            (4, false) => {
                self.asm.mov_rm32(dst, base, disp);
                self.asm.movsxd_rr(dst, dst);
            }
            _ => self.asm.mov_rm(dst, base, disp),
        }
    }

    fn store_sized(&mut self, base: Reg, disp: i32, src: Reg, size: u8) {
        match size {
            1 => self.asm.mov_mr8(base, disp, src),
            2 => self.asm.mov_mr16(base, disp, src),
            4 => self.asm.mov_mr32(base, disp, src),
            _ => self.asm.mov_mr(base, disp, src),
        }
    }

    fn binary_arith(&mut self, at: u32, op: ArithOp) -> Result<(), CompileError> {
        let (b, bk) = self.take_top(at)?;
        let (a, ak) = self.take_top(at)?;
        if ak == ValueKind::Float || bk == ValueKind::Float {
            self.asm.movq_xr(Xmm(0), POOL[a]);
            self.asm.movq_xr(Xmm(1), POOL[b]);
            match op {
                ArithOp::Add => self.asm.addsd(Xmm(0), Xmm(1)),
                ArithOp::Sub => self.asm.subsd(Xmm(0), Xmm(1)),
                ArithOp::Mul => self.asm.mulsd(Xmm(0), Xmm(1)),
            }
            self.asm.movq_rx(POOL[a], Xmm(0));
            self.release(b);
            self.push_in(a, ValueKind::Float, at)?;
            return Ok(());
        }
        let narrow = ak == ValueKind::I32 && bk == ValueKind::I32;
        match (op, narrow) {
            (ArithOp::Add, false) => self.asm.add_rr(POOL[a], POOL[b]),
            (ArithOp::Add, true) => self.asm.add_rr32(POOL[a], POOL[b]),
            (ArithOp::Sub, false) => self.asm.sub_rr(POOL[a], POOL[b]),
            (ArithOp::Sub, true) => self.asm.sub_rr32(POOL[a], POOL[b]),
            (ArithOp::Mul, false) => self.asm.imul_rr(POOL[a], POOL[b]),
            (ArithOp::Mul, true) => self.asm.imul_rr32(POOL[a], POOL[b]),
        }
        if narrow {
            self.asm.movsxd_rr(POOL[a], POOL[a]);
        }
        self.release(b);
        let kind = if narrow { ValueKind::I32 } else { ValueKind::I64 };
        self.push_in(a, kind, at)?;
        Ok(())
    }

    fn binary_int64(
        &mut self,
        at: u32,
        op: impl Fn(&mut Asm, Reg, Reg),
    ) -> Result<(), CompileError> {
        let (b, bk) = self.take_top(at)?;
        let (a, ak) = self.take_top(at)?;
        op(&mut self.asm, POOL[a], POOL[b]);
        self.release(b);
        let kind = if ak == ValueKind::I32 && bk == ValueKind::I32 {
            ValueKind::I32
        } else {
            ValueKind::I64
        };
        self.push_in(a, kind, at)?;
        Ok(())
    }

    fn binary_ovf(
        &mut self,
        at: u32,
        signed: bool,
        op: impl Fn(&mut Asm, Reg, Reg, bool),
    ) -> Result<(), CompileError> {
        let (b, bk) = self.take_top(at)?;
        let (a, ak) = self.take_top(at)?;
        let narrow = ak == ValueKind::I32 && bk == ValueKind::I32;
        op(&mut self.asm, POOL[a], POOL[b], !narrow);
        let cc = if signed { Cc::O } else { Cc::B };
        self.raise_if(cc, WellKnownException::Overflow);
        if narrow {
            self.asm.movsxd_rr(POOL[a], POOL[a]);
        }
        self.release(b);
        let kind = if narrow { ValueKind::I32 } else { ValueKind::I64 };
        self.push_in(a, kind, at)?;
        Ok(())
    }

    fn emit_div(&mut self, at: u32, signed: bool, quotient: bool) -> Result<(), CompileError> {
        let (b, bk) = self.take_top(at)?;
        let (a, ak) = self.take_top(at)?;
        if ak == ValueKind::Float || bk == ValueKind::Float {
            if !quotient {
                self.release(b);
                self.release(a);
                return Err(CompileError::Unsupported("float remainder", at));
            }
            self.asm.movq_xr(Xmm(0), POOL[a]);
            self.asm.movq_xr(Xmm(1), POOL[b]);
            self.asm.divsd(Xmm(0), Xmm(1));
            self.asm.movq_rx(POOL[a], Xmm(0));
            self.release(b);
            self.push_in(a, ValueKind::Float, at)?;
            return Ok(());
        }
        let narrow = ak == ValueKind::I32 && bk == ValueKind::I32;

        // Divide by zero.
        self.asm.test_rr(POOL[b], POOL[b]);
        self.raise_if(Cc::E, WellKnownException::DivideByZero);

        self.asm.mov_rr(regs::RAX, POOL[a]);
        if signed {
            // MIN / -1 overflows the quotient.
            self.asm.cmp_ri(POOL[b], -1);
            let skip = self.asm.jcc(Cc::Ne);
            if narrow {
                self.asm.cmp_ri32(regs::RAX, i32::MIN);
            } else {
                self.asm.mov_ri64(regs::RDX, i64::MIN as u64);
                self.asm.cmp_rr(regs::RAX, regs::RDX);
            }
            self.raise_if(Cc::E, WellKnownException::Overflow);
            let here = self.asm.pos();
            self.asm.patch_rel32(skip, here);
            if narrow {
                self.asm.cdq();
            } else {
                self.asm.cqo();
            }
            self.asm.idiv_r(POOL[b], !narrow);
        } else {
            self.asm.xor_rr32(regs::RDX, regs::RDX);
            self.asm.div_r(POOL[b], !narrow);
        }
        let result = if quotient { regs::RAX } else { regs::RDX };
        if narrow {
            self.asm.movsxd_rr(POOL[a], result);
        } else {
            self.asm.mov_rr(POOL[a], result);
        }
        self.release(b);
        let kind = if narrow { ValueKind::I32 } else { ValueKind::I64 };
        self.push_in(a, kind, at)?;
        Ok(())
    }

    /// `mode`: 0 = shl, 1 = shr (logical), 2 = sar (arithmetic).
    fn emit_shift(&mut self, at: u32, mode: u8) -> Result<(), CompileError> {
        let (count, _) = self.take_top(at)?;
        let (val, vk) = self.take_top(at)?;
        let narrow = vk == ValueKind::I32;
        self.asm.mov_rr(regs::RCX, POOL[count]);
        self.release(count);
        match mode {
            0 => self.asm.shl_cl(POOL[val], !narrow),
            1 => self.asm.shr_cl(POOL[val], !narrow),
            _ => self.asm.sar_cl(POOL[val], !narrow),
        }
        if narrow {
            self.asm.movsxd_rr(POOL[val], POOL[val]);
        }
        self.push_in(val, vk, at)?;
        Ok(())
    }

    fn emit_compare(&mut self, at: u32, cc: Cc) -> Result<(), CompileError> {
        let (b, bk) = self.take_top(at)?;
        let (a, ak) = self.take_top(at)?;
        if ak == ValueKind::Float || bk == ValueKind::Float {
            self.asm.movq_xr(Xmm(0), POOL[a]);
            self.asm.movq_xr(Xmm(1), POOL[b]);
            self.asm.ucomisd(Xmm(0), Xmm(1));
            let fcc = match cc {
                Cc::G => Cc::A,
                Cc::L => Cc::B,
                other => other,
            };
            self.asm.setcc_zx(fcc, POOL[a]);
        } else {
            self.asm.cmp_rr(POOL[a], POOL[b]);
            self.asm.setcc_zx(cc, POOL[a]);
        }
        self.release(b);
        self.push_in(a, ValueKind::I32, at)?;
        Ok(())
    }

    /// Sign/zero truncation conversions. `mode`: 0 i1, 1 u1, 2 i2, 3 u2,
    /// 4 i4, 5 u4.
    fn conv_small(&mut self, at: u32, mode: u8) -> Result<(), CompileError> {
        let (p, kind) = self.take_top(at)?;
        if kind == ValueKind::Float {
            self.asm.movq_xr(Xmm(0), POOL[p]);
            self.asm.cvttsd2si(POOL[p], Xmm(0));
        }
        let r = POOL[p];
        match mode {
            0 => self.asm.movsx_rr8(r, r),
            1 => self.asm.movzx_rr8(r, r),
            2 => self.asm.movsx_rr16(r, r),
            3 => self.asm.movzx_rr16(r, r),
            // i4/u4: keep the low 32 bits, stored sign-extended.
            _ => self.asm.movsxd_rr(r, r),
        }
        self.push_in(p, ValueKind::I32, at)?;
        Ok(())
    }

    fn conv_to_i64(&mut self, at: u32, signed: bool) -> Result<(), CompileError> {
        let (p, kind) = self.take_top(at)?;
        match kind {
            ValueKind::Float => {
                self.asm.movq_xr(Xmm(0), POOL[p]);
                self.asm.cvttsd2si(POOL[p], Xmm(0));
            }
            ValueKind::I32 if !signed => {
                // Zero-extend the 32-bit bits.
                self.asm.mov_rr32(POOL[p], POOL[p]);
            }
            _ => {}
        }
        self.push_in(p, ValueKind::I64, at)?;
        Ok(())
    }

    fn conv_ovf(&mut self, at: u32, min: i64, max: i64, _size: u8) -> Result<(), CompileError> {
        let (p, kind) = self.take_top(at)?;
        if kind == ValueKind::Float {
            self.asm.movq_xr(Xmm(0), POOL[p]);
            self.asm.cvttsd2si(POOL[p], Xmm(0));
        }
        let r = POOL[p];
        if i32::try_from(max).is_ok() {
            self.asm.cmp_ri(r, max as i32);
        } else {
            self.asm.mov_ri64(regs::RDX, max as u64);
            self.asm.cmp_rr(r, regs::RDX);
        }
        self.raise_if(Cc::G, WellKnownException::Overflow);
        if i32::try_from(min).is_ok() {
            self.asm.cmp_ri(r, min as i32);
        } else {
            self.asm.mov_ri64(regs::RDX, min as u64);
            self.asm.cmp_rr(r, regs::RDX);
        }
        self.raise_if(Cc::L, WellKnownException::Overflow);
        self.push_in(p, ValueKind::I32, at)?;
        Ok(())
    }

    fn read_branch_target(
        &mut self,
        cur: &mut IlCursor<'_>,
        short: bool,
    ) -> Result<u32, CompileError> {
        let d = if short {
            cur.read_i8()? as i32
        } else {
            cur.read_i32()?
        };
        Ok((cur.offset() as i32 + d) as u32)
    }

    fn branch_on_truth(&mut self, target: u32, cc: Cc, at: u32) -> Result<(), CompileError> {
        let (c, _) = self.take_top(at)?;
        self.spill_all();
        self.asm.test_rr(POOL[c], POOL[c]);
        self.release(c);
        let fix = self.asm.jcc(cc);
        self.fixups.push((fix, target));
        Ok(())
    }

    fn branch_cmp(
        &mut self,
        cur: &mut IlCursor<'_>,
        short: bool,
        cc: Cc,
        at: u32,
    ) -> Result<(), CompileError> {
        let target = self.read_branch_target(cur, short)?;
        let (b, bk) = self.take_top(at)?;
        let (a, ak) = self.take_top(at)?;
        self.spill_all();
        let cc = if ak == ValueKind::Float || bk == ValueKind::Float {
            self.asm.movq_xr(Xmm(0), POOL[a]);
            self.asm.movq_xr(Xmm(1), POOL[b]);
            self.asm.ucomisd(Xmm(0), Xmm(1));
            match cc {
                Cc::G => Cc::A,
                Cc::L => Cc::B,
                Cc::Ge => Cc::Ae,
                Cc::Le => Cc::Be,
                other => other,
            }
        } else {
            self.asm.cmp_rr(POOL[a], POOL[b]);
            cc
        };
        self.release(b);
        self.release(a);
        let fix = self.asm.jcc(cc);
        self.fixups.push((fix, target));
        Ok(())
    }

    fn emit_switch(&mut self, cur: &mut IlCursor<'_>, at: u32) -> Result<(), CompileError> {
        let n = cur.read_u32()?;
        let mut target_ils = Vec::with_capacity(n as usize);
        let mut deltas = Vec::with_capacity(n as usize);
        for _ in 0..n {
            deltas.push(cur.read_i32()?);
        }
        let next = cur.offset() as i32;
        for d in deltas {
            target_ils.push((next + d) as u32);
        }

        let (val, _) = self.take_top(at)?;
        self.spill_all();
        self.asm.cmp_ri(POOL[val], n as i32);
        let over = self.asm.jcc(Cc::Ae);

        // Dense jump table: absolute entries right after the dispatch code.
        let lea_at = self.asm.lea_rip(regs::RAX);
        self.asm.mov_rm_sib(regs::RAX, regs::RAX, POOL[val], 8, 0);
        self.asm.jmp_r(regs::RAX);
        let table = self.asm.pos();
        self.asm.patch_rel32(lea_at, table);
        for target in &target_ils {
            let entry_at = self.asm.pos();
            for _ in 0..8 {
                self.asm.nop();
            }
            // Reuse the nop bytes as the 8-byte slot.
            self.abs_il.push((entry_at, *target));
        }
        let after = self.asm.pos();
        self.asm.patch_rel32(over, after);
        self.release(val);
        Ok(())
    }

    fn element_address(&mut self, at: u32, size: u8) -> Result<usize, CompileError> {
        let (idx, _) = self.take_top(at)?;
        let (arr, _) = self.take_top(at)?;
        self.asm.test_rr(POOL[arr], POOL[arr]);
        self.raise_if(Cc::E, WellKnownException::NullReference);
        self.asm
            .cmp_rm(POOL[idx], POOL[arr], ARRAY_LENGTH_OFFSET as i32);
        self.raise_if(Cc::Ae, WellKnownException::IndexOutOfRange);
        self.asm.lea_sib(
            POOL[arr],
            POOL[arr],
            POOL[idx],
            size,
            ARRAY_DATA_OFFSET as i32,
        );
        self.release(idx);
        Ok(arr)
    }

    fn ldelem(
        &mut self,
        at: u32,
        size: u8,
        signed: bool,
        kind: ValueKind,
    ) -> Result<(), CompileError> {
        let addr = self.element_address(at, size)?;
        self.load_sized(POOL[addr], POOL[addr], 0, size, signed);
        self.push_in(addr, kind, at)?;
        Ok(())
    }

    fn stelem(&mut self, at: u32, size: u8) -> Result<(), CompileError> {
        let (val, _) = self.take_top(at)?;
        let addr = self.element_address(at, size)?;
        self.store_sized(POOL[addr], 0, POOL[val], size);
        self.release(val);
        self.release(addr);
        Ok(())
    }

    fn ldind(
        &mut self,
        at: u32,
        size: u8,
        signed: bool,
        kind: ValueKind,
    ) -> Result<(), CompileError> {
        let (addr, _) = self.take_top(at)?;
        self.load_sized(POOL[addr], POOL[addr], 0, size, signed);
        self.push_in(addr, kind, at)?;
        Ok(())
    }

    fn stind(&mut self, at: u32, size: u8) -> Result<(), CompileError> {
        let (val, _) = self.take_top(at)?;
        let (addr, _) = self.take_top(at)?;
        self.store_sized(POOL[addr], 0, POOL[val], size);
        self.release(val);
        self.release(addr);
        Ok(())
    }

    fn emit_block_copy(&mut self, dst: Reg, src: Reg, len: Option<Reg>, fixed_len: i32) {
        // RSI/RDI are callee-saved; preserve them around the string op.
        self.asm.push_r(regs::RSI);
        self.asm.push_r(regs::RDI);
        self.asm.mov_rr(regs::RDI, dst);
        self.asm.mov_rr(regs::RSI, src);
        match len {
            Some(l) => self.asm.mov_rr(regs::RCX, l),
            None => self.asm.mov_ri32(regs::RCX, fixed_len),
        }
        self.asm.rep_movsb();
        self.asm.pop_r(regs::RDI);
        self.asm.pop_r(regs::RSI);
    }

    fn emit_block_zero(&mut self, addr: Reg, size: i32) {
        self.asm.xor_rr32(regs::RAX, regs::RAX);
        let mut off = 0;
        while off + 8 <= size {
            self.asm.mov_mr(addr, off, regs::RAX);
            off += 8;
        }
        while off < size {
            self.asm.mov_mr8(addr, off, regs::RAX);
            off += 1;
        }
    }

    fn emit_call(&mut self, token: u32, at: u32) -> Result<(), CompileError> {
        let entry = self
            .deps
            .methods
            .get(token)
            .ok_or(CompileError::UnresolvedToken(token, at))?;
        self.spill_all();
        self.marshal_args(entry.arg_count, at)?;
        self.asm.mov_ri64(regs::RAX, entry.entrypoint);
        self.asm.call_r(regs::RAX);
        self.finish_call(entry.arg_count, entry.return_kind, &[], at)
    }

    fn emit_callvirt(&mut self, token: u32, at: u32) -> Result<(), CompileError> {
        let entry = self
            .deps
            .methods
            .get(token)
            .ok_or(CompileError::UnresolvedToken(token, at))?;
        self.spill_all();
        match entry.dispatch {
            DispatchKind::Virtual { slot } => {
                self.marshal_args(entry.arg_count, at)?;
                self.asm.test_rr(regs::RCX, regs::RCX);
                self.raise_if(Cc::E, WellKnownException::NullReference);
                self.asm.mov_rm(regs::RAX, regs::RCX, 0);
                self.asm
                    .mov_rm(regs::RAX, regs::RAX, MT_VTABLE_OFFSET as i32 + 8 * slot as i32);
                self.asm.call_r(regs::RAX);
            }
            DispatchKind::Interface {
                interface_mt,
                method_index,
            } => {
                // Resolve through the receiver's interface map, then call
                // the returned entrypoint with the args marshalled fresh.
                let this_off = self
                    .frame
                    .spill_offset(self.stack.len() - entry.arg_count as usize);
                self.asm.mov_rm(regs::RCX, regs::RBP, this_off);
                self.asm.mov_ri64(regs::RDX, interface_mt.addr());
                self.asm.mov_ri64(regs::R8, method_index as u64);
                self.asm
                    .mov_ri64(regs::RAX, self.deps.helpers.resolve_interface);
                self.asm.call_r(regs::RAX);
                self.record_safe_point(&[]);
                // Park the resolved entrypoint: marshalling scratches RAX.
                self.asm.mov_rr(regs::R10, regs::RAX);
                self.marshal_args(entry.arg_count, at)?;
                self.asm.call_r(regs::R10);
            }
            _ => {
                // `callvirt` on a non-virtual method is a plain call.
                self.marshal_args(entry.arg_count, at)?;
                self.asm.test_rr(regs::RCX, regs::RCX);
                self.raise_if(Cc::E, WellKnownException::NullReference);
                self.asm.mov_ri64(regs::RAX, entry.entrypoint);
                self.asm.call_r(regs::RAX);
            }
        }
        self.finish_call(entry.arg_count, entry.return_kind, &[], at)
    }

    fn emit_newobj(&mut self, token: u32, at: u32) -> Result<(), CompileError> {
        let entry = self
            .deps
            .methods
            .get(token)
            .ok_or(CompileError::UnresolvedToken(token, at))?;
        let DispatchKind::Constructor { owning_mt } = entry.dispatch else {
            return Err(CompileError::UnresolvedToken(token, at));
        };
        let ctor_args = entry.arg_count.saturating_sub(1);
        if (self.stack.len() as u16) < ctor_args {
            return Err(CompileError::StackUnderflow(at));
        }

        self.spill_all();
        self.asm.mov_ri64(regs::RCX, owning_mt.addr());
        self.asm.mov_ri64(regs::RAX, self.deps.helpers.new_fast);
        self.asm.call_r(regs::RAX);
        self.record_safe_point(&[]);

        // Park the new object in its own operand slot, then call the
        // constructor with `this` plus the pending arguments.
        let p = self.push_fresh(ValueKind::Ref, at)?;
        self.asm.mov_rr(POOL[p], regs::RAX);
        self.spill_all();

        let obj_off = self.frame.spill_offset(self.stack.len() - 1);
        self.asm.mov_rm(regs::RCX, regs::RBP, obj_off);
        let base = self.stack.len() - 1 - ctor_args as usize;
        for i in 0..ctor_args as usize {
            let off = self.frame.spill_offset(base + i);
            if i + 1 < 4 {
                self.asm.mov_rm(ARG_REGS[i + 1], regs::RBP, off);
            } else {
                self.asm.mov_rm(regs::RAX, regs::RBP, off);
                self.asm
                    .mov_mr(regs::RSP, 0x20 + 8 * (i as i32 + 1 - 4), regs::RAX);
            }
        }
        self.asm.mov_ri64(regs::RAX, entry.entrypoint);
        self.asm.call_r(regs::RAX);
        // The object slot stays live across the constructor.
        self.record_safe_point(&[obj_off]);

        // Drop the args and the parked object, then re-push the result
        // from its (still intact) slot.
        self.drop_stack_to(base);
        let res = self.push_fresh(ValueKind::Ref, at)?;
        self.asm.mov_rm(POOL[res], regs::RBP, obj_off);
        Ok(())
    }

    fn emit_unbox(&mut self, token: u32, at: u32) -> Result<(), CompileError> {
        let mt = self
            .deps
            .types
            .resolve(token)
            .ok_or(CompileError::UnresolvedToken(token, at))?;
        self.spill_all();
        let top = self.top_slot_offset(at)?;
        self.asm.mov_rm(regs::RCX, regs::RBP, top);
        self.asm.mov_ri64(regs::RDX, mt.addr());
        self.asm.mov_ri64(regs::RAX, self.deps.helpers.unbox);
        self.asm.call_r(regs::RAX);
        self.drop_stack_to(self.stack.len() - 1);
        self.record_safe_point(&[]);
        let p = self.push_fresh(ValueKind::ByRef, at)?;
        self.asm.mov_rr(POOL[p], regs::RAX);
        Ok(())
    }

    fn emit_leave(
        &mut self,
        target: u32,
        at: u32,
        region: RegionKind,
    ) -> Result<(), CompileError> {
        // `leave` empties the evaluation stack.
        self.drop_stack_to(0);

        // Does any finally/fault protect this site but not the target?
        let needs_runtime = self.body.eh_clauses.iter().any(|c| {
            matches!(c.kind, EhClauseKind::Finally | EhClauseKind::Fault)
                && (c.try_contains(at) || c.handler_contains(at))
                && !c.try_contains(target)
        });
        if needs_runtime {
            let site_at = self.asm.pos();
            self.asm.mov_ri64(regs::RCX, 0);
            self.relocs.push(AbsReloc {
                at: site_at + 2,
                native: site_at as u32,
            });
            let target_at = self.asm.pos();
            self.asm.mov_ri64(regs::RDX, 0);
            self.abs_il.push((target_at + 2, target));
            self.asm.mov_rr(regs::R8, regs::RBP);
            self.asm.mov_ri64(regs::RAX, self.deps.helpers.leave);
            self.asm.call_r(regs::RAX);
            self.record_safe_point(&[]);
        }

        match region {
            RegionKind::Main => {
                let fix = self.asm.jmp();
                self.fixups.push((fix, target));
            }
            _ => {
                // Leaving a handler: hand the continuation back to the
                // dispatcher through the funclet return value.
                let ret_at = self.asm.pos();
                self.asm.mov_ri64(regs::RAX, 0);
                self.abs_il.push((ret_at + 2, target));
                self.emit_funclet_return();
            }
        }
        Ok(())
    }
}

fn element_size(mt: crate::types::MethodTablePtr) -> u32 {
    if mt.flags().contains(MethodTableFlags::HAS_COMPONENT_SIZE) {
        mt.component_size() as u32
    } else if mt.is_reference_type() {
        8
    } else {
        mt.base_size().saturating_sub(8).max(1)
    }
}
