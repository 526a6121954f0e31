//! Replaying unwind codes to roll a context back to its caller

use crate::format::{UnwindCode, UnwindFlags};
use crate::{Context, FunctionTableRegistry, UnwindError, UnwindInfo};

/// Result of unwinding one frame.
#[derive(Debug)]
pub enum StepResult {
    /// The caller's context.
    Caller(Context),
    /// The walk is complete (the popped return address was zero).
    End,
}

/// Largest UNWIND_INFO blob the unwinder will read. Generous; a real blob is
/// a few dozen bytes plus handler data.
const MAX_UNWIND_INFO_BYTES: usize = 4096;

#[inline]
unsafe fn read_u64(addr: u64) -> u64 {
    core::ptr::read_unaligned(addr as *const u64)
}

#[inline]
unsafe fn read_u128(addr: u64) -> u128 {
    core::ptr::read_unaligned(addr as *const u128)
}

/// Fetch and parse the UNWIND_INFO for a function entry.
///
/// # Safety
///
/// `image_base + unwind_info_rva` must point at a live blob, which holds for
/// every entry the runtime registers.
pub unsafe fn load_unwind_info(
    image_base: u64,
    unwind_info_rva: u32,
) -> Result<UnwindInfo, UnwindError> {
    let addr = image_base + unwind_info_rva as u64;
    let bytes = core::slice::from_raw_parts(addr as *const u8, MAX_UNWIND_INFO_BYTES);
    UnwindInfo::parse(bytes)
}

/// Roll `ctx` back by one frame.
///
/// The unwind codes of the function containing `ctx.rip` are replayed in
/// reverse; afterwards the return address is popped into RIP and RSP is
/// adjusted past it. Codes describing prolog instructions that had not yet
/// executed at `ctx.rip` are skipped, so a context captured mid-prolog
/// unwinds correctly.
///
/// # Safety
///
/// The context must describe a live (suspended or self-owned) stack whose
/// frames match the registered tables, per the registry contract.
pub unsafe fn unwind_one(
    registry: &FunctionTableRegistry,
    ctx: &Context,
) -> Result<StepResult, UnwindError> {
    let (func, image_base) = registry.lookup_required(ctx.rip)?;
    let info = load_unwind_info(image_base, func.unwind_info_rva)?;
    if info.flags.contains(UnwindFlags::CHAININFO) {
        log::warn!(
            "chained unwind info at rip {:#x} is not supported",
            ctx.rip
        );
        return Err(UnwindError::ChainedInfo);
    }

    let func_offset = ctx.rip - (image_base + func.begin_rva as u64);

    let mut next = ctx.clone();
    let mut machframe = false;

    // If a frame register is established, RSP may have moved since the
    // prolog (alloca, funclet stacks); recover the post-SET_FPREG RSP from
    // the frame register before replaying the codes below it. The replay
    // order (reverse prolog order) visits SET_FPREG before the codes that
    // executed earlier in the prolog, which is exactly the order the
    // adjustments have to be undone in.
    for code in info.codes.iter().rev() {
        if u64::from(code.offset()) > func_offset {
            continue;
        }
        match *code {
            UnwindCode::PushNonvol { reg, .. } => {
                let v = read_u64(next.rsp());
                next.gpr[reg as usize] = v;
                next.set_rsp(next.rsp() + 8);
            }
            UnwindCode::Alloc { size, .. } => {
                next.set_rsp(next.rsp() + size as u64);
            }
            UnwindCode::SetFpReg { .. } => {
                let (reg, fp_offset) = info
                    .frame_register
                    .ok_or(UnwindError::Unencodable("SET_FPREG without frame register"))?;
                next.set_rsp(next.gpr[reg as usize] - 16 * fp_offset as u64);
            }
            UnwindCode::SaveNonvol {
                reg, stack_offset, ..
            } => {
                next.gpr[reg as usize] = read_u64(next.rsp() + stack_offset as u64);
            }
            UnwindCode::SaveXmm128 {
                reg, stack_offset, ..
            } => {
                next.xmm[reg as usize] = read_u128(next.rsp() + stack_offset as u64);
            }
            UnwindCode::PushMachFrame { has_error_code, .. } => {
                let base = next.rsp() + if has_error_code { 8 } else { 0 };
                next.rip = read_u64(base);
                next.set_rsp(read_u64(base + 24));
                machframe = true;
            }
        }
    }

    if !machframe {
        next.rip = read_u64(next.rsp());
        next.set_rsp(next.rsp() + 8);
    }

    if next.rip == 0 {
        return Ok(StepResult::End);
    }
    Ok(StepResult::Caller(next))
}

/// Forward-execute a prolog description against real memory, for tests and
/// the unwinder equivalence property. Returns the post-prolog context.
pub fn apply_prolog(ctx: &Context, info: &UnwindInfo) -> Context {
    let mut cur = ctx.clone();
    for code in &info.codes {
        match *code {
            UnwindCode::PushNonvol { reg, .. } => {
                cur.set_rsp(cur.rsp() - 8);
                unsafe {
                    core::ptr::write_unaligned(cur.rsp() as *mut u64, cur.gpr[reg as usize]);
                }
            }
            UnwindCode::Alloc { size, .. } => {
                cur.set_rsp(cur.rsp() - size as u64);
            }
            UnwindCode::SetFpReg { .. } => {
                let (reg, fp_offset) = info.frame_register.expect("frame register");
                cur.gpr[reg as usize] = cur.rsp() + 16 * fp_offset as u64;
            }
            UnwindCode::SaveNonvol {
                reg, stack_offset, ..
            } => unsafe {
                core::ptr::write_unaligned(
                    (cur.rsp() + stack_offset as u64) as *mut u64,
                    cur.gpr[reg as usize],
                );
            },
            UnwindCode::SaveXmm128 {
                reg, stack_offset, ..
            } => unsafe {
                core::ptr::write_unaligned(
                    (cur.rsp() + stack_offset as u64) as *mut u128,
                    cur.xmm[reg as usize],
                );
            },
            UnwindCode::PushMachFrame { .. } => {
                unreachable!("machine frames are pushed by hardware, not prologs")
            }
        }
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::gpr;
    use crate::format::RuntimeFunction;

    /// A fake stack plus registry entry around a built UnwindInfo. The
    /// "image" is the unwind blob itself; the function range is synthetic.
    struct Fixture {
        _blob: Vec<u8>,
        _stack: Box<[u64; 256]>,
        registry: FunctionTableRegistry,
        image_base: u64,
        entry_ctx: Context,
    }

    fn fixture(info: &UnwindInfo, ret_addr: u64) -> Fixture {
        let mut blob = Vec::new();
        info.emit(&mut blob).unwrap();

        let mut stack = Box::new([0u64; 256]);
        // Leave room above for pushes; plant the return address mid-buffer.
        let top = 200usize;
        stack[top] = ret_addr;
        let rsp = &stack[top] as *const u64 as u64;

        let registry = FunctionTableRegistry::new();
        let image_base = blob.as_ptr() as u64;
        // Function range [0x0, 0x100) relative to the blob; the unwind info
        // lives at rva 0 (the blob itself).
        registry.add(
            image_base,
            vec![RuntimeFunction {
                begin_rva: 0,
                end_rva: 0x100,
                unwind_info_rva: 0,
            }],
        );

        let mut entry_ctx = Context::zeroed();
        entry_ctx.set_rsp(rsp);
        entry_ctx.rip = image_base; // function entry

        Fixture {
            _blob: blob,
            _stack: stack,
            registry,
            image_base,
            entry_ctx,
        }
    }

    #[test]
    fn test_standard_frame_prolog_unwinds() {
        // push rbp; mov rbp, rsp; sub rsp, 64
        let mut info = UnwindInfo::new(9);
        info.frame_register = Some((gpr::RBP as u8, 0));
        info.codes = vec![
            UnwindCode::PushNonvol {
                offset: 2,
                reg: gpr::RBP as u8,
            },
            UnwindCode::SetFpReg { offset: 5 },
            UnwindCode::Alloc { offset: 9, size: 64 },
        ];

        let fx = fixture(&info, 0xABCD_0000);
        let mut pre = fx.entry_ctx.clone();
        pre.set_rbp(0x1111_2222);

        let mut post = apply_prolog(&pre, &info);
        post.rip = fx.image_base + 0x20; // somewhere in the body
        post.set_rbp(post.rsp() + 64); // what SET_FPREG computed

        // A body instruction clobbered nothing nonvolatile; unwind.
        let got = match unsafe { unwind_one(&fx.registry, &post) }.unwrap() {
            StepResult::Caller(c) => c,
            StepResult::End => panic!("unexpected end"),
        };
        assert_eq!(got.rip, 0xABCD_0000);
        assert_eq!(got.rsp(), pre.rsp() + 8);
        assert_eq!(got.rbp(), 0x1111_2222);
    }

    #[test]
    fn test_fp_frame_unwind_ignores_moved_rsp() {
        // Same frame, but the body moved RSP (localloc); the frame register
        // must anchor the replay.
        let mut info = UnwindInfo::new(9);
        info.frame_register = Some((gpr::RBP as u8, 0));
        info.codes = vec![
            UnwindCode::PushNonvol {
                offset: 2,
                reg: gpr::RBP as u8,
            },
            UnwindCode::SetFpReg { offset: 5 },
            UnwindCode::Alloc { offset: 9, size: 64 },
        ];

        let fx = fixture(&info, 0x7777_0000);
        let mut pre = fx.entry_ctx.clone();
        pre.set_rbp(0xAAAA_BBBB);

        let mut post = apply_prolog(&pre, &info);
        post.rip = fx.image_base + 0x30;
        post.set_rbp(post.rsp() + 64);
        post.set_rsp(post.rsp() - 256); // dynamic allocation

        let got = match unsafe { unwind_one(&fx.registry, &post) }.unwrap() {
            StepResult::Caller(c) => c,
            StepResult::End => panic!("unexpected end"),
        };
        assert_eq!(got.rip, 0x7777_0000);
        assert_eq!(got.rsp(), pre.rsp() + 8);
        assert_eq!(got.rbp(), 0xAAAA_BBBB);
    }

    #[test]
    fn test_partial_prolog_skips_unexecuted_codes() {
        let mut info = UnwindInfo::new(9);
        info.frame_register = Some((gpr::RBP as u8, 0));
        info.codes = vec![
            UnwindCode::PushNonvol {
                offset: 2,
                reg: gpr::RBP as u8,
            },
            UnwindCode::SetFpReg { offset: 5 },
            UnwindCode::Alloc { offset: 9, size: 64 },
        ];

        let fx = fixture(&info, 0x1234_5678);
        let mut pre = fx.entry_ctx.clone();
        pre.set_rbp(0xDEAD_0001);

        // Execute only the first push: context sits at prolog offset 2.
        let only_push = UnwindInfo {
            codes: vec![info.codes[0]],
            ..info.clone()
        };
        let mut mid = apply_prolog(&pre, &only_push);
        mid.rip = fx.image_base + 2;

        let got = match unsafe { unwind_one(&fx.registry, &mid) }.unwrap() {
            StepResult::Caller(c) => c,
            StepResult::End => panic!("unexpected end"),
        };
        assert_eq!(got.rip, 0x1234_5678);
        assert_eq!(got.rbp(), 0xDEAD_0001);
        assert_eq!(got.rsp(), pre.rsp() + 8);
    }

    #[test]
    fn test_saved_nonvolatiles_restored() {
        // push rbp; push r12; push rbx; sub rsp, 32; mov [rsp+8], rsi
        let mut info = UnwindInfo::new(16);
        info.codes = vec![
            UnwindCode::PushNonvol {
                offset: 2,
                reg: gpr::RBP as u8,
            },
            UnwindCode::PushNonvol {
                offset: 4,
                reg: gpr::R12 as u8,
            },
            UnwindCode::PushNonvol {
                offset: 6,
                reg: gpr::RBX as u8,
            },
            UnwindCode::Alloc {
                offset: 10,
                size: 32,
            },
            UnwindCode::SaveNonvol {
                offset: 16,
                reg: gpr::RSI as u8,
                stack_offset: 8,
            },
        ];

        let fx = fixture(&info, 0x4242_4242);
        let mut pre = fx.entry_ctx.clone();
        pre.set_rbp(101);
        pre.gpr[gpr::R12] = 102;
        pre.gpr[gpr::RBX] = 103;
        pre.gpr[gpr::RSI] = 104;

        let mut post = apply_prolog(&pre, &info);
        post.rip = fx.image_base + 0x40;
        // Body clobbers everything the prolog saved.
        post.set_rbp(0);
        post.gpr[gpr::R12] = 0;
        post.gpr[gpr::RBX] = 0;
        post.gpr[gpr::RSI] = 0;

        let got = match unsafe { unwind_one(&fx.registry, &post) }.unwrap() {
            StepResult::Caller(c) => c,
            StepResult::End => panic!("unexpected end"),
        };
        assert_eq!(got.rip, 0x4242_4242);
        assert_eq!(got.rbp(), 101);
        assert_eq!(got.gpr[gpr::R12], 102);
        assert_eq!(got.gpr[gpr::RBX], 103);
        assert_eq!(got.gpr[gpr::RSI], 104);
        assert_eq!(got.rsp(), pre.rsp() + 8);
    }

    #[test]
    fn test_zero_return_address_ends_walk() {
        let info = UnwindInfo::new(0);
        let fx = fixture(&info, 0);
        let mut ctx = fx.entry_ctx.clone();
        ctx.rip = fx.image_base + 4;
        assert!(matches!(
            unsafe { unwind_one(&fx.registry, &ctx) }.unwrap(),
            StepResult::End
        ));
    }

    #[test]
    fn test_unregistered_rip_is_an_error() {
        let registry = FunctionTableRegistry::new();
        let mut ctx = Context::zeroed();
        ctx.rip = 0xDEAD;
        assert_eq!(
            unsafe { unwind_one(&registry, &ctx) }.unwrap_err(),
            UnwindError::UnregisteredRip(0xDEAD)
        );
    }
}
