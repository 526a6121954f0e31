//! The IL → x86-64 JIT
//!
//! `compile` turns a parsed method body into position-independent bytes
//! plus metadata; `install` places them in the code heap and publishes the
//! unwind table and GCInfo. `compile_and_install` is the everyday entry:
//!
//! ```ignore
//! let body = MethodBody::parse(&bytes)?;
//! let m = jit::compile_and_install(&body, sig)?;
//! let f: extern "win64" fn(i64) -> i64 = unsafe { transmute(m.entrypoint) };
//! ```

pub mod compiler;
pub mod emit;
pub mod install;
pub mod stack_model;

pub use compiler::{compile, AbsReloc, CompileDeps, CompileError, CompiledMethod, FuncletInfo};
pub use install::{install, InstalledMethod};
pub use stack_model::{FrameLayout, ValueKind};

use crate::runtime::runtime;
use vela_il::{MethodBody, MethodSig};

impl CompileDeps<'static> {
    /// Deps over the process runtime's registries.
    pub fn from_runtime() -> Self {
        let rt = runtime();
        Self {
            methods: &rt.methods,
            types: &rt.types,
            statics: &rt.statics,
            strings: &rt.strings,
            helpers: &rt.helpers,
            exceptions: &rt.exceptions,
        }
    }
}

/// Compile a body against the process runtime and install the result.
/// Returns the same errors as [`compile`]; a heap-exhausted install maps
/// to `CompileError::Unsupported("code heap exhausted")`.
pub fn compile_and_install(
    body: &MethodBody<'_>,
    sig: MethodSig,
) -> Result<InstalledMethod, CompileError> {
    let rt = runtime();
    let deps = CompileDeps::from_runtime();
    let compiled = compile(body, sig, &deps)?;
    install(&compiled, &rt.code_heap, &rt.unwind, &rt.gcinfo)
        .ok_or(CompileError::Unsupported("code heap exhausted", 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_il::{method::build_tiny, ReturnKind};

    fn sig(args: u16, locals: u16, ret: ReturnKind) -> MethodSig {
        MethodSig {
            arg_count: args,
            local_count: locals,
            return_kind: ret,
        }
    }

    #[test]
    fn test_compile_records_monotonic_il_map() {
        // ldarg.0; ldc.i4.s 10; add; stloc.0; ldloc.0; ldc.i4.2; mul; ret
        let il = [0x02, 0x1F, 0x0A, 0x58, 0x0A, 0x06, 0x18, 0x5A, 0x2A];
        let body_bytes = build_tiny(&il).unwrap();
        let body = MethodBody::parse(&body_bytes).unwrap();
        let deps = CompileDeps::from_runtime();
        let m = compile(&body, sig(1, 1, ReturnKind::I64), &deps).unwrap();

        // Every instruction start maps, strictly monotonic, within bounds.
        let starts = [0u32, 1, 3, 4, 5, 6, 8];
        let mut prev = None;
        for s in starts {
            let n = m.native_offset(s).unwrap();
            assert!(n < m.code.len() as u32);
            if let Some(p) = prev {
                assert!(n > p, "native offsets must grow: {p} !< {n}");
            }
            prev = Some(n);
        }
        assert!(m.native_clauses.is_empty());
        assert!(m.funclets.is_empty());
        assert_eq!(m.frame_alloc % 16, 0);
    }

    #[test]
    fn test_compile_unknown_opcode_fails_cleanly() {
        let il = [0xA6, 0x2A]; // hole in the opcode map
        let body_bytes = build_tiny(&il).unwrap();
        let body = MethodBody::parse(&body_bytes).unwrap();
        let deps = CompileDeps::from_runtime();
        assert!(compile(&body, sig(0, 0, ReturnKind::Void), &deps).is_err());
    }

    #[test]
    fn test_compile_unresolved_call_token_fails() {
        // call 0xDEAD0001; ret
        let mut il = vec![0x28];
        il.extend_from_slice(&0xDEAD_0001u32.to_le_bytes());
        il.push(0x2A);
        let body_bytes = build_tiny(&il).unwrap();
        let body = MethodBody::parse(&body_bytes).unwrap();
        let deps = CompileDeps::from_runtime();
        let err = compile(&body, sig(0, 0, ReturnKind::Void), &deps).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedToken(0xDEAD_0001, _)));
    }

    #[test]
    fn test_eh_clause_conversion_invariants() {
        use vela_il::method::build_fat;
        use vela_il::{EhClause, EhClauseKind};

        // try { nop; leave L } finally { endfinally } L: ldc.i4.1; ret
        let il = [
            0x00, // 0: nop
            0xDE, 0x05, // 1: leave.s +5 -> 8
            0xDC, // 3: endfinally (handler)
            0x17, // 4..: unreachable padding inside handler end bound
            0x00, 0x00, 0x00, // padding
            0x17, // 8: ldc.i4.1
            0x2A, // 9: ret
        ];
        let clauses = [EhClause {
            kind: EhClauseKind::Finally,
            try_begin: 0,
            try_end: 3,
            handler_begin: 3,
            handler_end: 4,
            class_token_or_filter: 0,
        }];
        let body_bytes = build_fat(&il, 4, 0, &clauses);
        let body = MethodBody::parse(&body_bytes).unwrap();
        let deps = CompileDeps::from_runtime();
        let m = compile(&body, sig(0, 0, ReturnKind::I32), &deps).unwrap();

        assert_eq!(m.native_clauses.len(), 1);
        let c = m.native_clauses[0];
        assert!(c.try_begin < c.try_end);
        assert!(c.handler_begin < c.handler_end);
        // Try range lives in the main body; the funclet lives past it and
        // never overlaps.
        assert!(c.try_end <= m.main_end);
        assert!(c.handler_begin >= m.main_end);
        assert!(c.handler_end <= m.code.len() as u32);
        assert_eq!(m.funclets.len(), 1);
        assert_eq!(m.funclets[0].begin, c.handler_begin);
        assert_eq!(m.funclets[0].end, c.handler_end);
    }

    #[test]
    fn test_gcinfo_registers_safe_point_per_call() {
        use crate::gc::GcInfo;
        use crate::runtime::helpers::tokens;

        // ldc.i4.0; call gc_collect (0 args, i64); pop; pop? -> just ret
        let mut il = vec![0x28];
        il.extend_from_slice(&tokens::GC_COLLECT.to_le_bytes());
        il.push(0x26); // pop result
        il.push(0x2A); // ret
        let body_bytes = build_tiny(&il).unwrap();
        let body = MethodBody::parse(&body_bytes).unwrap();
        let deps = CompileDeps::from_runtime();
        let m = compile(&body, sig(0, 0, ReturnKind::Void), &deps).unwrap();

        let info = GcInfo::decode(&m.gcinfo).unwrap();
        assert_eq!(info.num_safe_points(), 1);
        assert!(info.has_frame_pointer());
        // The safe point is the return offset of the call, inside the code.
        assert!(info.safe_point_offset(0) < m.main_end);
    }
}
