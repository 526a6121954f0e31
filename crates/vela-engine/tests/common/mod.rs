//! Shared plumbing for the end-to-end scenario tests
//!
//! Tests that run emitted code register the calling thread as a mutator;
//! they serialize on one lock and unregister on the way out so a
//! collection in one test never waits on another test's idle thread.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, OnceLock};
use vela_engine::jit::{self, InstalledMethod};
use vela_engine::runtime::runtime;
use vela_il::{method, EhClause, MethodBody, MethodSig, ReturnKind};

static LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serialize a test that touches the process runtime.
pub fn serial() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    match LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Unregister the calling thread from the mutator registry.
pub fn done() {
    runtime().threads.unregister_current();
}

/// Small IL writer for hand-built method bodies.
pub struct IlAsm {
    pub bytes: Vec<u8>,
}

impl IlAsm {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn op(&mut self, b: u8) -> &mut Self {
        self.bytes.push(b);
        self
    }

    pub fn ext(&mut self, b: u8) -> &mut Self {
        self.bytes.push(0xFE);
        self.bytes.push(b);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes.push(v);
        self
    }

    pub fn i8(&mut self, v: i8) -> &mut Self {
        self.bytes.push(v as u8);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }
}

/// Compile and install a body built from raw IL.
pub fn install_method(
    il: &[u8],
    arg_count: u16,
    local_count: u16,
    return_kind: ReturnKind,
    clauses: &[EhClause],
) -> InstalledMethod {
    let body_bytes = if clauses.is_empty() && il.len() <= 0x3F {
        method::build_tiny(il).unwrap()
    } else {
        method::build_fat(il, 16, 0, clauses)
    };
    let body = MethodBody::parse(&body_bytes).unwrap();
    let sig = MethodSig {
        arg_count,
        local_count,
        return_kind,
    };
    jit::compile_and_install(&body, sig).expect("compilation failed")
}

pub unsafe fn entry0(m: &InstalledMethod) -> extern "win64" fn() -> i64 {
    core::mem::transmute(m.entrypoint as usize)
}

pub unsafe fn entry1(m: &InstalledMethod) -> extern "win64" fn(i64) -> i64 {
    core::mem::transmute(m.entrypoint as usize)
}

pub unsafe fn entry2(m: &InstalledMethod) -> extern "win64" fn(i64, i64) -> i64 {
    core::mem::transmute(m.entrypoint as usize)
}
