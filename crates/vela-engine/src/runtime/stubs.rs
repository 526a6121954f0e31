//! Assembly stubs on the managed↔runtime boundary
//!
//! Four pieces of hand-written code glue emitted (win64) code to the Rust
//! runtime:
//!
//! - `vela_transition_call_stub`: the universal helper thunk. Emitted code
//!   calls it with the real helper address in RAX and the helper's
//!   arguments in RCX/RDX/R8/R9 plus up to four caller-stack slots; the
//!   stub publishes a transition frame (return address, caller RSP, caller
//!   RBP), forwards the call with the stack args re-homed, and unpublishes
//!   on the way out.
//! - `vela_throw_stub`: entered by emitted `throw` sequences and raise
//!   stubs with the exception object in RCX. Captures the full register
//!   context of the raise site and enters the dispatcher. Never returns.
//! - `vela_call_funclet`: invokes an EH funclet with the dispatch ABI
//!   (exception in RCX, establisher frame in RDX) after loading the
//!   nonvolatile registers of the interrupted context, so a catch funclet
//!   that returns from its parent observes the caller's state.
//! - `vela_restore_context`: loads RSP/RBP/RIP and the nonvolatiles from a
//!   `Context` and jumps into it. Used to resume a leave continuation.
//!
//! Context field offsets are pinned by `vela_unwind::context` and asserted
//! in its tests: rip +0, gpr[i] +8+8*i, xmm[i] +144+16*i.

use crate::runtime::thread::{ThreadRegistry, TransitionFrame};
use vela_unwind::Context;

core::arch::global_asm!(
    r#"
.text

.globl vela_transition_call_stub
vela_transition_call_stub:
    push rbx
    push rbp
    mov rbp, rsp
    sub rsp, 0x68
    mov rbx, rax
    mov qword ptr [rsp + 0x40], rcx
    mov qword ptr [rsp + 0x48], rdx
    mov qword ptr [rsp + 0x50], r8
    mov qword ptr [rsp + 0x58], r9
    mov r10, qword ptr [rbp + 0x38]
    mov qword ptr [rsp + 0x20], r10
    mov r10, qword ptr [rbp + 0x40]
    mov qword ptr [rsp + 0x28], r10
    mov r10, qword ptr [rbp + 0x48]
    mov qword ptr [rsp + 0x30], r10
    mov r10, qword ptr [rbp + 0x50]
    mov qword ptr [rsp + 0x38], r10
    mov rcx, qword ptr [rbp + 0x10]
    lea rdx, [rbp + 0x18]
    mov r8, qword ptr [rbp]
    call vela_rt_enter_transition
    mov rcx, qword ptr [rsp + 0x40]
    mov rdx, qword ptr [rsp + 0x48]
    mov r8, qword ptr [rsp + 0x50]
    mov r9, qword ptr [rsp + 0x58]
    call rbx
    mov rbx, rax
    movq qword ptr [rsp + 0x60], xmm0
    call vela_rt_leave_transition
    mov rax, rbx
    movq xmm0, qword ptr [rsp + 0x60]
    mov rsp, rbp
    pop rbp
    pop rbx
    ret

.globl vela_throw_stub
vela_throw_stub:
    sub rsp, 0x1B8
    mov qword ptr [rsp + 0x28], rax
    mov qword ptr [rsp + 0x30], rcx
    mov qword ptr [rsp + 0x38], rdx
    mov qword ptr [rsp + 0x40], rbx
    lea rax, [rsp + 0x1C0]
    mov qword ptr [rsp + 0x48], rax
    mov qword ptr [rsp + 0x50], rbp
    mov qword ptr [rsp + 0x58], rsi
    mov qword ptr [rsp + 0x60], rdi
    mov qword ptr [rsp + 0x68], r8
    mov qword ptr [rsp + 0x70], r9
    mov qword ptr [rsp + 0x78], r10
    mov qword ptr [rsp + 0x80], r11
    mov qword ptr [rsp + 0x88], r12
    mov qword ptr [rsp + 0x90], r13
    mov qword ptr [rsp + 0x98], r14
    mov qword ptr [rsp + 0xA0], r15
    mov rax, qword ptr [rsp + 0x1B8]
    mov qword ptr [rsp + 0x20], rax
    movups xmmword ptr [rsp + 0x110], xmm6
    movups xmmword ptr [rsp + 0x120], xmm7
    movups xmmword ptr [rsp + 0x130], xmm8
    movups xmmword ptr [rsp + 0x140], xmm9
    movups xmmword ptr [rsp + 0x150], xmm10
    movups xmmword ptr [rsp + 0x160], xmm11
    movups xmmword ptr [rsp + 0x170], xmm12
    movups xmmword ptr [rsp + 0x180], xmm13
    movups xmmword ptr [rsp + 0x190], xmm14
    movups xmmword ptr [rsp + 0x1A0], xmm15
    lea rdx, [rsp + 0x20]
    call vela_eh_raise_exception
    int3

.globl vela_call_funclet
vela_call_funclet:
    push rbp
    push rbx
    push rsi
    push rdi
    push r12
    push r13
    push r14
    push r15
    sub rsp, 0x28
    mov rax, rcx
    mov r10, r9
    test r10, r10
    jz 2f
    mov rbx, qword ptr [r10 + 32]
    mov rsi, qword ptr [r10 + 56]
    mov rdi, qword ptr [r10 + 64]
    mov r12, qword ptr [r10 + 104]
    mov r13, qword ptr [r10 + 112]
    mov r14, qword ptr [r10 + 120]
    mov r15, qword ptr [r10 + 128]
2:
    mov rcx, rdx
    mov rdx, r8
    call rax
    add rsp, 0x28
    pop r15
    pop r14
    pop r13
    pop r12
    pop rdi
    pop rsi
    pop rbx
    pop rbp
    ret

.globl vela_restore_context
vela_restore_context:
    mov rax, qword ptr [rcx + 8]
    mov rbx, qword ptr [rcx + 32]
    mov rbp, qword ptr [rcx + 48]
    mov rsi, qword ptr [rcx + 56]
    mov rdi, qword ptr [rcx + 64]
    mov r12, qword ptr [rcx + 104]
    mov r13, qword ptr [rcx + 112]
    mov r14, qword ptr [rcx + 120]
    mov r15, qword ptr [rcx + 128]
    movups xmm6, xmmword ptr [rcx + 240]
    movups xmm7, xmmword ptr [rcx + 256]
    movups xmm8, xmmword ptr [rcx + 272]
    movups xmm9, xmmword ptr [rcx + 288]
    movups xmm10, xmmword ptr [rcx + 304]
    movups xmm11, xmmword ptr [rcx + 320]
    movups xmm12, xmmword ptr [rcx + 336]
    movups xmm13, xmmword ptr [rcx + 352]
    movups xmm14, xmmword ptr [rcx + 368]
    movups xmm15, xmmword ptr [rcx + 384]
    mov rdx, qword ptr [rcx]
    mov rsp, qword ptr [rcx + 40]
    jmp rdx
"#
);

extern "win64" {
    /// The universal transition thunk. Not callable from Rust (the helper
    /// address travels in RAX); declared so its address can be baked into
    /// emitted call sequences.
    pub fn vela_transition_call_stub();

    /// Raise path entry. Emitted code jumps here with the exception in RCX.
    pub fn vela_throw_stub();

    /// Invoke an EH funclet: `(funclet, exception, establisher, ctx)`.
    /// `ctx` may be null when no interrupted context exists (leave path).
    pub fn vela_call_funclet(funclet: u64, exception: u64, establisher: u64, ctx: *const Context)
        -> u64;

    /// Resume execution at a context. Loads nonvolatiles, RSP, RBP, RIP.
    pub fn vela_restore_context(ctx: *const Context) -> !;
}

/// Publish a transition frame for the calling thread and take a world
/// share for the runtime section. Called from the transition stub with the
/// managed return address, the managed caller's RSP and its RBP. The frame
/// goes up before the share so a collector that already holds the world
/// sees the thread as pinned with its stack walkable while this call
/// blocks.
#[no_mangle]
pub extern "win64" fn vela_rt_enter_transition(rip: u64, rsp: u64, rbp: u64) {
    let rt = crate::runtime::runtime();
    let thread = rt.threads.register_current();
    thread.push_transition(TransitionFrame { rip, rsp, rbp });
    rt.world_enter_shared();
}

/// Release the world share, park if a stop is pending (the transition
/// frame is still published, so the parked stack stays walkable), then
/// unpublish the frame and return to managed code.
#[no_mangle]
pub extern "win64" fn vela_rt_leave_transition() {
    let rt = crate::runtime::runtime();
    rt.world_exit_shared();
    rt.safepoints.poll();
    if let Some(thread) = ThreadRegistry::current() {
        thread.pop_transition();
    }
}
