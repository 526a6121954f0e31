//! Installing compiled methods: code-heap placement, unwind registration
//!
//! The emitted bytes land in the code heap followed by the method's
//! UNWIND_INFO blobs (main body first, then one per funclet). Every RVA is
//! relative to the method's own allocation, which becomes the image base
//! of its function table, so a method registers exactly one table holding
//! its main RUNTIME_FUNCTION plus one disjoint entry per funclet.

use crate::eh::write_clause_table;
use crate::gc::GcInfoIndex;
use crate::heap::CodeHeap;
use crate::jit::compiler::CompiledMethod;
use crate::jit::stack_model::OUTGOING_BYTES;
use std::sync::Arc;
use vela_unwind::context::gpr;
use vela_unwind::{FunctionTableRegistry, RuntimeFunction, TableId, UnwindCode, UnwindFlags, UnwindInfo};

/// A method living in the code heap.
#[derive(Debug, Clone, Copy)]
pub struct InstalledMethod {
    /// Base of the allocation (also the image base of its unwind table).
    pub code_base: u64,
    /// Entrypoint (same as `code_base`; the prolog is the first byte).
    pub entrypoint: u64,
    /// End of the main body region.
    pub main_end: u64,
    /// The registered unwind table, for deregistration in tests.
    pub table_id: TableId,
}

fn main_unwind_info(m: &CompiledMethod) -> UnwindInfo {
    let mut info = UnwindInfo::new(m.prolog_size);
    info.frame_register = Some((gpr::RBP as u8, 0));
    info.codes = vec![
        UnwindCode::PushNonvol {
            offset: 1,
            reg: gpr::RBP as u8,
        },
        UnwindCode::SetFpReg { offset: 4 },
        UnwindCode::Alloc {
            offset: m.prolog_size,
            size: m.frame_alloc,
        },
    ];
    if !m.native_clauses.is_empty() {
        info.flags |= UnwindFlags::EHANDLER;
        info.handler_rva = Some(0);
        info.handler_data = write_clause_table(&m.native_clauses);
    }
    info
}

fn funclet_unwind_info() -> UnwindInfo {
    // Funclet prolog: push rbp (1) + mov rbp, rdx (3) + sub rsp, imm32 (7).
    let mut info = UnwindInfo::new(11);
    info.codes = vec![
        UnwindCode::PushNonvol {
            offset: 1,
            reg: gpr::RBP as u8,
        },
        UnwindCode::Alloc {
            offset: 11,
            size: OUTGOING_BYTES,
        },
    ];
    info
}

/// Copy a compiled method into the code heap and register its unwind table
/// and GCInfo. Returns `None` when the code heap is exhausted.
pub fn install(
    m: &CompiledMethod,
    code_heap: &CodeHeap,
    unwind: &FunctionTableRegistry,
    gcinfo: &GcInfoIndex,
) -> Option<InstalledMethod> {
    let mut image = m.code.clone();
    while image.len() % 4 != 0 {
        image.push(0xCC);
    }

    let main_info = main_unwind_info(m);
    let main_info_rva = image.len() as u32;
    main_info.emit(&mut image).ok()?;

    let mut funclet_rvas = Vec::with_capacity(m.funclets.len());
    for _ in &m.funclets {
        while image.len() % 4 != 0 {
            image.push(0xCC);
        }
        funclet_rvas.push(image.len() as u32);
        funclet_unwind_info().emit(&mut image).ok()?;
    }

    let dest = code_heap.alloc(image.len(), 16)?;
    let code_base = dest.addr();

    // Absolute fixups resolve against the final base.
    for r in &m.relocs {
        let value = code_base + r.native as u64;
        image[r.at..r.at + 8].copy_from_slice(&value.to_le_bytes());
    }
    unsafe {
        core::ptr::copy_nonoverlapping(image.as_ptr(), dest.as_ptr(), image.len());
    }

    let mut functions = vec![RuntimeFunction {
        begin_rva: 0,
        end_rva: m.main_end,
        unwind_info_rva: main_info_rva,
    }];
    for (f, rva) in m.funclets.iter().zip(&funclet_rvas) {
        functions.push(RuntimeFunction {
            begin_rva: f.begin,
            end_rva: f.end,
            unwind_info_rva: *rva,
        });
    }
    let table_id = unwind.add(code_base, functions);

    gcinfo.register(
        code_base,
        code_base + m.main_end as u64,
        Arc::new(m.gcinfo.clone()),
    );
    for f in &m.funclets {
        gcinfo.register(
            code_base + f.begin as u64,
            code_base + f.end as u64,
            Arc::new(f.gcinfo.clone()),
        );
    }

    log::trace!(
        "installed {} bytes of code ({} funclets) at {code_base:#x}",
        m.code.len(),
        m.funclets.len()
    );
    Some(InstalledMethod {
        code_base,
        entrypoint: code_base,
        main_end: code_base + m.main_end as u64,
        table_id,
    })
}
