//! GCInfo codec roundtrip: the decoder must reproduce the encoder's safe
//! points, slot table and liveness bitmap exactly, for the S11 shape and
//! for arbitrary inputs within the stated limits.

use proptest::prelude::*;
use vela_engine::gc::{GcInfo, GcInfoEncoder, GcSlot, SlotBase};

#[test]
fn test_s11_exact_roundtrip() {
    // encode (100, [slot@-8, slot@-16], safe_points=[20,45,80], all-live)
    let mut enc = GcInfoEncoder::new(100, true);
    let s0 = enc.add_slot(GcSlot {
        base: SlotBase::FramePointer,
        offset: -8,
        is_interior: false,
        is_pinned: false,
    });
    let s1 = enc.add_slot(GcSlot {
        base: SlotBase::FramePointer,
        offset: -16,
        is_interior: false,
        is_pinned: false,
    });
    for off in [20, 45, 80] {
        let sp = enc.add_safe_point(off);
        enc.set_live(sp, s0);
        enc.set_live(sp, s1);
    }

    let dec = GcInfo::decode(&enc.finish()).unwrap();
    assert_eq!(dec.code_length(), 100);
    assert_eq!(dec.num_slots(), 2);
    assert_eq!(dec.num_safe_points(), 3);
    assert_eq!(dec.slot(0).offset, -8);
    assert_eq!(dec.slot(1).offset, -16);
    for (i, off) in [20u32, 45, 80].into_iter().enumerate() {
        assert_eq!(dec.safe_point_offset(i as u32), off);
    }
    for sp in 0..3 {
        for s in 0..2 {
            assert!(dec.is_slot_live(sp, s));
        }
    }
}

#[derive(Debug, Clone)]
struct Shape {
    code_length: u32,
    has_fp: bool,
    slots: Vec<(u8, i32, bool, bool)>,
    safe_deltas: Vec<u32>,
    live_seed: u64,
}

fn shape_strategy() -> impl Strategy<Value = Shape> {
    (
        1u32..1_000_000,
        any::<bool>(),
        proptest::collection::vec((0u8..3, -4096i32..4096, any::<bool>(), any::<bool>()), 0..12),
        proptest::collection::vec(1u32..5000, 0..24),
        any::<u64>(),
    )
        .prop_map(|(code_length, has_fp, slots, safe_deltas, live_seed)| Shape {
            code_length,
            has_fp,
            slots,
            safe_deltas,
            live_seed,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]
    #[test]
    fn roundtrip_is_identity(shape in shape_strategy()) {
        let mut enc = GcInfoEncoder::new(shape.code_length, shape.has_fp);

        let mut slot_defs = Vec::new();
        for &(base, offset, interior, pinned) in &shape.slots {
            let slot = GcSlot {
                base: match base {
                    0 => SlotBase::CallerSp,
                    1 => SlotBase::Sp,
                    _ => SlotBase::FramePointer,
                },
                offset,
                is_interior: interior,
                is_pinned: pinned,
            };
            let id = enc.add_slot(slot);
            if id as usize == slot_defs.len() {
                slot_defs.push(slot);
            }
        }

        let mut offsets = Vec::new();
        let mut cur = 0u32;
        for d in &shape.safe_deltas {
            cur += d;
            offsets.push(cur);
            enc.add_safe_point(cur);
        }

        // Deterministic pseudo-random liveness.
        let mut live = vec![];
        let mut state = shape.live_seed | 1;
        for sp in 0..offsets.len() as u32 {
            for slot in 0..slot_defs.len() as u32 {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                if state >> 63 == 1 {
                    enc.set_live(sp, slot);
                    live.push((sp, slot));
                }
            }
        }

        let dec = GcInfo::decode(&enc.finish()).unwrap();
        prop_assert_eq!(dec.code_length(), shape.code_length);
        prop_assert_eq!(dec.has_frame_pointer(), shape.has_fp);
        prop_assert_eq!(dec.num_slots() as usize, slot_defs.len());
        prop_assert_eq!(dec.num_safe_points() as usize, offsets.len());
        for (i, &off) in offsets.iter().enumerate() {
            prop_assert_eq!(dec.safe_point_offset(i as u32), off);
        }
        for (i, &slot) in slot_defs.iter().enumerate() {
            prop_assert_eq!(dec.slot(i as u32), slot);
        }
        for sp in 0..offsets.len() as u32 {
            for slot in 0..slot_defs.len() as u32 {
                let expect = live.contains(&(sp, slot));
                prop_assert_eq!(dec.is_slot_live(sp, slot), expect);
            }
        }
    }
}
