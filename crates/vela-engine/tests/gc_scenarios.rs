//! End-to-end GC scenarios: objects rooted only by JIT frames survive a
//! collection forced at a safe point; garbage does not.

mod common;

use common::{done, entry0, install_method, serial, IlAsm};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vela_engine::runtime::helpers::tokens;
use vela_engine::runtime::runtime;
use vela_engine::runtime::tokens::FieldDesc;
use vela_engine::types::MethodTableBuilder;
use vela_il::ReturnKind;

#[test]
fn test_s10_object_survives_collection_at_safe_point() {
    let _g = serial();
    let rt = runtime();

    let mt = MethodTableBuilder::class(16).build();
    let field = FieldDesc {
        offset: 8,
        size: 8,
        signed: true,
        is_ref: false,
    }
    .encode();

    // f():
    //   rhp_new_fast(mt); pop              // garbage
    //   var o = rhp_new_fast(mt)
    //   o.f = 0xDEADBEEF
    //   gc_collect(); pop
    //   return o.f
    let mut a = IlAsm::new();
    a.op(0x21).i64(mt.addr() as i64); // ldc.i8 mt
    a.op(0x28).u32(tokens::RHP_NEW_FAST);
    a.op(0x26); // pop (garbage object)
    a.op(0x21).i64(mt.addr() as i64);
    a.op(0x28).u32(tokens::RHP_NEW_FAST);
    a.op(0x0A); // stloc.0 (GC-rooted local)
    a.op(0x06); // ldloc.0
    a.op(0x21).i64(0xDEAD_BEEF);
    a.op(0x7D).u32(field); // stfld
    a.op(0x28).u32(tokens::GC_COLLECT);
    a.op(0x26); // pop freed-count
    a.op(0x06); // ldloc.0
    a.op(0x7B).u32(field); // ldfld
    a.op(0x2A); // ret
    let m = install_method(&a.bytes, 0, 1, ReturnKind::I64, &[]);
    let f = unsafe { entry0(&m) };

    let collections_before = rt.collector.stats().collections;
    assert_eq!(f(), 0xDEAD_BEEF);

    let stats = rt.collector.stats();
    assert_eq!(stats.collections, collections_before + 1);
    // The unrooted allocation was swept while the rooted one survived.
    assert!(stats.last_freed >= 1, "garbage object was not swept");
    done();
}

#[test]
fn test_collection_reuses_freed_blocks() {
    let _g = serial();
    let rt = runtime();

    let mt = MethodTableBuilder::class(48).build();

    // Allocate garbage, collect, and observe the free list feeding the
    // next allocation of the same shape.
    let mut a = IlAsm::new();
    a.op(0x21).i64(mt.addr() as i64);
    a.op(0x28).u32(tokens::RHP_NEW_FAST);
    a.op(0x26);
    a.op(0x28).u32(tokens::GC_COLLECT);
    a.op(0x2A); // return blocks freed
    let m = install_method(&a.bytes, 0, 0, ReturnKind::I64, &[]);
    let f = unsafe { entry0(&m) };

    let freed = f();
    assert!(freed >= 1);
    let (bytes, count) = rt.gc_heap.free_list_stats();
    assert!(count >= 1);
    assert!(bytes >= 48);
    done();
}

#[test]
fn test_second_mutator_parks_during_collection() {
    let _g = serial();
    let rt = runtime();

    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let stop = stop.clone();
        std::thread::spawn(move || {
            let rt = runtime();
            rt.threads.register_current();
            while !stop.load(Ordering::Acquire) {
                rt.poll();
                std::thread::yield_now();
            }
            rt.threads.unregister_current();
        })
    };

    // Run a collection from this thread while the worker polls; the stop
    // protocol must park it and release it.
    rt.threads.register_current();
    let _ = rt.collect();
    let _ = rt.collect();

    stop.store(true, Ordering::Release);
    worker.join().unwrap();
    done();
}
