//! End-to-end exception scenarios: overflow traps, finally unwinding,
//! nested handlers, filters, rethrow, and leave continuations.

mod common;

use common::{done, entry0, entry1, install_method, serial, IlAsm};
use vela_engine::runtime::runtime;
use vela_engine::runtime::tokens::{StaticField, StaticFieldTable};
use vela_engine::runtime::WellKnownException;
use vela_engine::types::{MethodTableBuilder, MethodTablePtr, ObjectRef};
use vela_il::{EhClause, EhClauseKind, ReturnKind};

fn typed(try_range: (u32, u32), handler: (u32, u32), token: u32) -> EhClause {
    EhClause {
        kind: EhClauseKind::Typed,
        try_begin: try_range.0,
        try_end: try_range.1,
        handler_begin: handler.0,
        handler_end: handler.1,
        class_token_or_filter: token,
    }
}

fn finally(try_range: (u32, u32), handler: (u32, u32)) -> EhClause {
    EhClause {
        kind: EhClauseKind::Finally,
        try_begin: try_range.0,
        try_end: try_range.1,
        handler_begin: handler.0,
        handler_end: handler.1,
        class_token_or_filter: 0,
    }
}

/// A process-lifetime i64 cell surfaced as a static-field token.
fn static_counter(statics: &StaticFieldTable, token: u32) -> &'static mut i64 {
    let cell = Box::leak(Box::new(0i64));
    statics.register(
        token,
        StaticField {
            addr: cell as *mut i64 as u64,
            size: 8,
            signed: true,
            is_ref: false,
        },
    );
    cell
}

/// A throwable object with its own MethodTable, plus the type token for
/// catch clauses.
fn throwable(token: u32) -> (MethodTablePtr, ObjectRef) {
    let rt = runtime();
    let mt = MethodTableBuilder::class(16).build();
    rt.types.register(token, mt);
    let p = rt.gc_heap.alloc(16).unwrap();
    let obj = ObjectRef::from_payload(p);
    obj.set_method_table(mt);
    // Tests hold the only reference; root it for the GC scenarios that may
    // run in the same process.
    let root = Box::leak(Box::new(obj.addr()));
    rt.static_roots.register(root as *mut u64 as u64, 1);
    (mt, obj)
}

#[test]
fn test_s4_overflow_trap_caught() {
    let _g = serial();
    let rt = runtime();

    const TOKEN_OVF: u32 = 0x0200_2001;
    rt.types.register(
        TOKEN_OVF,
        rt.exceptions.method_table(WellKnownException::Overflow),
    );

    let mut a = IlAsm::new();
    a.op(0x20).i32(0x7FFF_FFFF); // 0: ldc.i4 int.MaxValue
    a.op(0x17); // 5: ldc.i4.1
    a.op(0xD6); // 6: add.ovf
    a.op(0x26); // 7: pop
    a.op(0xDE).i8(3); // 8: leave.s -> 13
    a.op(0x26); // 10: (catch) pop exception
    a.op(0x15); // 11: ldc.i4.m1
    a.op(0x2A); // 12: ret
    a.op(0x16); // 13: ldc.i4.0
    a.op(0x2A); // 14: ret
    let clauses = [typed((0, 10), (10, 13), TOKEN_OVF)];
    let m = install_method(&a.bytes, 0, 0, ReturnKind::I64, &clauses);
    let f = unsafe { entry0(&m) };

    assert_eq!(f(), -1);
    done();
}

#[test]
fn test_s5_try_finally_unwind() {
    let _g = serial();
    let rt = runtime();

    const TOKEN_E: u32 = 0x0200_2002;
    const STATIC_C: u32 = 0x0400_2002;
    let counter = static_counter(&rt.statics, STATIC_C);
    let (_mt, exc) = throwable(TOKEN_E);

    let mut a = IlAsm::new();
    a.op(0x21).i64(exc.addr() as i64); // 0: ldc.i8 <exception>
    a.op(0x7A); // 9: throw
    a.op(0x7E).u32(STATIC_C); // 10: (finally) ldsfld C
    a.op(0x17); // 15: ldc.i4.1
    a.op(0x58); // 16: add
    a.op(0x80).u32(STATIC_C); // 17: stsfld C
    a.op(0xDC); // 22: endfinally
    a.op(0x26); // 23: (catch) pop
    a.op(0x7E).u32(STATIC_C); // 24: ldsfld C
    a.op(0x2A); // 29: ret
    let clauses = [
        finally((0, 10), (10, 23)),
        typed((0, 10), (23, 30), TOKEN_E),
    ];
    let m = install_method(&a.bytes, 0, 0, ReturnKind::I64, &clauses);
    let f = unsafe { entry0(&m) };

    assert_eq!(f(), 1);
    assert_eq!(*counter, 1);
    done();
}

#[test]
fn test_s6_nested_try_finally() {
    let _g = serial();
    let rt = runtime();

    const TOKEN_E: u32 = 0x0200_2003;
    const STATIC_C: u32 = 0x0400_2003;
    let counter = static_counter(&rt.statics, STATIC_C);
    let (_mt, exc) = throwable(TOKEN_E);

    let mut a = IlAsm::new();
    a.op(0x21).i64(exc.addr() as i64); // 0
    a.op(0x7A); // 9: throw
    // inner finally: C += 1
    a.op(0x7E).u32(STATIC_C); // 10
    a.op(0x17); // 15
    a.op(0x58); // 16
    a.op(0x80).u32(STATIC_C); // 17
    a.op(0xDC); // 22
    // outer finally: C += 10
    a.op(0x7E).u32(STATIC_C); // 23
    a.op(0x1F).i8(10); // 28: ldc.i4.s 10
    a.op(0x58); // 30
    a.op(0x80).u32(STATIC_C); // 31
    a.op(0xDC); // 36
    // catch: return C
    a.op(0x26); // 37
    a.op(0x7E).u32(STATIC_C); // 38
    a.op(0x2A); // 43
    let clauses = [
        finally((0, 10), (10, 23)),
        finally((0, 10), (23, 37)),
        typed((0, 10), (37, 44), TOKEN_E),
    ];
    let m = install_method(&a.bytes, 0, 0, ReturnKind::I64, &clauses);
    let f = unsafe { entry0(&m) };

    assert_eq!(f(), 11);
    assert_eq!(*counter, 11);
    done();
}

#[test]
fn test_filter_selects_handler() {
    let _g = serial();
    let rt = runtime();

    const TOKEN_E: u32 = 0x0200_2004;
    const STATIC_FLAG: u32 = 0x0400_2004;
    let flag = static_counter(&rt.statics, STATIC_FLAG);
    let (_mt, exc) = throwable(TOKEN_E);

    let mut a = IlAsm::new();
    a.op(0x21).i64(exc.addr() as i64); // 0
    a.op(0x7A); // 9: throw
    a.op(0x7E).u32(STATIC_FLAG); // 10: (filter) ldsfld FLAG
    a.ext(0x11); // 15: endfilter
    a.op(0x26); // 17: (filter handler) pop
    a.op(0x1B); // 18: ldc.i4.5
    a.op(0x2A); // 19: ret
    a.op(0x26); // 20: (catch-all) pop
    a.op(0x1D); // 21: ldc.i4.7
    a.op(0x2A); // 22: ret
    let clauses = [
        EhClause {
            kind: EhClauseKind::Filter,
            try_begin: 0,
            try_end: 10,
            handler_begin: 17,
            handler_end: 20,
            class_token_or_filter: 10,
        },
        typed((0, 10), (20, 23), TOKEN_E),
    ];
    let m = install_method(&a.bytes, 0, 0, ReturnKind::I64, &clauses);
    let f = unsafe { entry0(&m) };

    *flag = 1;
    assert_eq!(f(), 5); // the filter accepted
    *flag = 0;
    assert_eq!(f(), 7); // filter declined; the typed handler took it
    done();
}

#[test]
fn test_rethrow_reaches_outer_handler() {
    let _g = serial();
    let rt = runtime();

    const TOKEN_E: u32 = 0x0200_2005;
    const STATIC_C: u32 = 0x0400_2005;
    let counter = static_counter(&rt.statics, STATIC_C);
    let (_mt, exc) = throwable(TOKEN_E);

    let mut a = IlAsm::new();
    a.op(0x21).i64(exc.addr() as i64); // 0
    a.op(0x7A); // 9: throw
    a.op(0x26); // 10: (inner catch) pop
    a.op(0x7E).u32(STATIC_C); // 11
    a.op(0x17); // 16
    a.op(0x58); // 17
    a.op(0x80).u32(STATIC_C); // 18
    a.ext(0x1A); // 23: rethrow
    a.op(0x26); // 25: (outer catch) pop
    a.op(0x7E).u32(STATIC_C); // 26
    a.op(0x2A); // 31: ret
    let clauses = [
        typed((0, 10), (10, 25), TOKEN_E),
        typed((0, 10), (25, 32), TOKEN_E),
    ];
    let m = install_method(&a.bytes, 0, 0, ReturnKind::I64, &clauses);
    let f = unsafe { entry0(&m) };

    assert_eq!(f(), 1);
    assert_eq!(*counter, 1);
    done();
}

#[test]
fn test_leave_from_catch_resumes_main_body() {
    let _g = serial();

    const TOKEN_E: u32 = 0x0200_2006;
    let (_mt, exc) = throwable(TOKEN_E);

    let mut a = IlAsm::new();
    a.op(0x1B); // 0: ldc.i4.5
    a.op(0x0A); // 1: stloc.0
    a.op(0x21).i64(exc.addr() as i64); // 2: ldc.i8
    a.op(0x7A); // 11: throw
    a.op(0x26); // 12: (catch) pop
    a.op(0xDE).i8(0); // 13: leave.s -> 15
    a.op(0x06); // 15: ldloc.0
    a.op(0x2A); // 16: ret
    let clauses = [typed((2, 12), (12, 15), TOKEN_E)];
    let m = install_method(&a.bytes, 0, 1, ReturnKind::I64, &clauses);
    let f = unsafe { entry0(&m) };

    assert_eq!(f(), 5);
    done();
}

#[test]
fn test_divide_by_zero_raises_and_is_caught() {
    let _g = serial();
    let rt = runtime();

    const TOKEN_DBZ: u32 = 0x0200_2007;
    rt.types.register(
        TOKEN_DBZ,
        rt.exceptions.method_table(WellKnownException::DivideByZero),
    );

    // f(a, b) = try { a / b } catch(DivideByZero) { -7 }
    let mut a = IlAsm::new();
    a.op(0x02); // 0: ldarg.0
    a.op(0x03); // 1: ldarg.1
    a.op(0x5B); // 2: div
    a.op(0x0A); // 3: stloc.0
    a.op(0xDE).i8(4); // 4: leave.s -> 10
    a.op(0x26); // 6: (catch) pop
    a.op(0x1F).i8(-7); // 7: ldc.i4.s -7
    a.op(0x2A); // 9: ret
    a.op(0x06); // 10: ldloc.0 (leave target)
    a.op(0x2A); // 11: ret
    let clauses = [typed((0, 6), (6, 10), TOKEN_DBZ)];
    let m = install_method(&a.bytes, 2, 1, ReturnKind::I64, &clauses);
    let f = unsafe { common::entry2(&m) };

    assert_eq!(f(12, 4), 3);
    assert_eq!(f(12, 0), -7);
    done();
}

#[test]
fn test_index_out_of_range_raises_and_is_caught() {
    let _g = serial();
    let rt = runtime();

    const TOKEN_IOR: u32 = 0x0200_2008;
    const TOKEN_I32T: u32 = 0x0200_2009;
    rt.types.register(
        TOKEN_IOR,
        rt.exceptions
            .method_table(WellKnownException::IndexOutOfRange),
    );
    let int_mt = MethodTableBuilder::class(12).value_type().build();
    rt.types.register(TOKEN_I32T, int_mt);

    // f(i) = try { (new int[4])[i] } catch(IndexOutOfRange) { -2 }
    let mut a = IlAsm::new();
    a.op(0x1A); // 0: ldc.i4.4
    a.op(0x8D).u32(TOKEN_I32T); // 1: newarr
    a.op(0x02); // 6: ldarg.0
    a.op(0x94); // 7: ldelem.i4
    a.op(0x0A); // 8: stloc.0
    a.op(0xDE).i8(4); // 9: leave.s -> 15
    a.op(0x26); // 11: (catch) pop
    a.op(0x1F).i8(-2); // 12: ldc.i4.s -2
    a.op(0x2A); // 14: ret
    a.op(0x06); // 15: ldloc.0
    a.op(0x2A); // 16: ret
    let clauses = [typed((0, 11), (11, 15), TOKEN_IOR)];
    let m = install_method(&a.bytes, 1, 1, ReturnKind::I64, &clauses);
    let f = unsafe { entry1(&m) };

    assert_eq!(f(2), 0); // fresh array elements are zeroed
    assert_eq!(f(4), -2);
    assert_eq!(f(-1), -2);
    done();
}
