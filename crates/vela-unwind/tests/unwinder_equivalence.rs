//! Property: for any prolog describable by unwind codes, executing the
//! prolog against real memory and then unwinding the resulting context
//! yields the original caller context bit-identically (RIP, RSP, RBP and
//! every preserved nonvolatile).

use proptest::prelude::*;
use vela_unwind::context::gpr;
use vela_unwind::unwinder::apply_prolog;
use vela_unwind::{
    unwind_one, Context, FunctionTableRegistry, RuntimeFunction, StepResult, UnwindCode,
    UnwindInfo,
};

const NONVOLATILE: [usize; 8] = [
    gpr::RBP,
    gpr::RBX,
    gpr::RSI,
    gpr::RDI,
    gpr::R12,
    gpr::R13,
    gpr::R14,
    gpr::R15,
];

/// A generated prolog: which registers to push, how much to allocate,
/// whether to establish RBP, and which registers to save into the frame.
#[derive(Debug, Clone)]
struct PrologPlan {
    pushes: Vec<usize>,
    alloc_slots: u32,
    set_fpreg: bool,
    saves: Vec<(usize, u32)>,
}

fn plan_strategy() -> impl Strategy<Value = PrologPlan> {
    (
        proptest::sample::subsequence(NONVOLATILE.to_vec(), 0..=4),
        1u32..64,
        any::<bool>(),
        proptest::sample::subsequence(
            vec![gpr::RBX, gpr::RSI, gpr::RDI, gpr::R13, gpr::R14],
            0..=3,
        ),
    )
        .prop_map(|(pushes, alloc_slots, set_fpreg, save_regs)| {
            // Saves go at distinct 8-aligned offsets inside the allocation.
            let saves = save_regs
                .into_iter()
                .enumerate()
                .filter(|(i, _)| (*i as u32) < alloc_slots)
                .map(|(i, r)| (r, i as u32 * 8))
                .collect();
            PrologPlan {
                pushes,
                alloc_slots,
                set_fpreg,
                saves,
            }
        })
}

fn build_info(plan: &PrologPlan) -> UnwindInfo {
    let mut codes = Vec::new();
    let mut offset = 0u8;
    for &reg in &plan.pushes {
        offset += 2;
        codes.push(UnwindCode::PushNonvol {
            offset,
            reg: reg as u8,
        });
    }
    offset += 7;
    codes.push(UnwindCode::Alloc {
        offset,
        size: plan.alloc_slots * 8,
    });
    if plan.set_fpreg {
        offset += 4;
        codes.push(UnwindCode::SetFpReg { offset });
    }
    for &(reg, stack_offset) in &plan.saves {
        offset += 5;
        codes.push(UnwindCode::SaveNonvol {
            offset,
            reg: reg as u8,
            stack_offset,
        });
    }

    let mut info = UnwindInfo::new(offset);
    if plan.set_fpreg {
        info.frame_register = Some((gpr::RBP as u8, 0));
    }
    info.codes = codes;
    info
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]
    #[test]
    fn prolog_then_unwind_is_identity(plan in plan_strategy()) {
        let info = build_info(&plan);

        let mut blob = Vec::new();
        info.emit(&mut blob).unwrap();

        let mut stack = vec![0u64; 1024].into_boxed_slice();
        let top = 900usize;
        let ret_addr = 0x00C0_FFEE_0000_1234u64;
        stack[top] = ret_addr;

        let registry = FunctionTableRegistry::new();
        let image_base = blob.as_ptr() as u64;
        registry.add(
            image_base,
            vec![RuntimeFunction {
                begin_rva: 0,
                end_rva: 0x1000,
                unwind_info_rva: 0,
            }],
        );

        // Caller context: distinctive values in every nonvolatile.
        let mut pre = Context::zeroed();
        pre.set_rsp(&stack[top] as *const u64 as u64);
        for (i, &reg) in NONVOLATILE.iter().enumerate() {
            pre.gpr[reg] = 0x1000_0000 + i as u64;
        }

        let mut post = apply_prolog(&pre, &info);
        post.rip = image_base + info.prolog_size as u64;
        // The body clobbers every register the prolog preserved, except an
        // established frame register, which by contract stays live.
        for &reg in &plan.pushes {
            if !(plan.set_fpreg && reg == gpr::RBP) {
                post.gpr[reg] = 0xBAAD;
            }
        }
        for &(reg, _) in &plan.saves {
            post.gpr[reg] = 0xBAAD;
        }

        let got = match unsafe { unwind_one(&registry, &post) }.unwrap() {
            StepResult::Caller(c) => c,
            StepResult::End => panic!("unexpected end of walk"),
        };

        prop_assert_eq!(got.rip, ret_addr);
        prop_assert_eq!(got.rsp(), pre.rsp() + 8);
        for &reg in &plan.pushes {
            prop_assert_eq!(got.gpr[reg], pre.gpr[reg]);
        }
        for &(reg, _) in &plan.saves {
            prop_assert_eq!(got.gpr[reg], pre.gpr[reg]);
        }
        // Registers the prolog never touched pass through unchanged.
        for &reg in &NONVOLATILE {
            if !plan.pushes.contains(&reg) && !plan.saves.iter().any(|&(r, _)| r == reg) {
                prop_assert_eq!(got.gpr[reg], post.gpr[reg]);
            }
        }
    }
}
