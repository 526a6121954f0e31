//! GCInfo: per-method maps of GC-live stack slots at safe points
//!
//! Wire layout, all varints ULEB128 unless noted:
//!
//! ```text
//! code_length            uleb
//! flags                  u8   bit0 = has_frame_pointer
//! num_slots              uleb
//! num_safe_points        uleb
//! slot table             per slot: u8 (base | flag bits), sleb offset
//! safe points            first absolute, then deltas, uleb
//! liveness bitmap        ceil(num_slots * num_safe_points / 8) bytes,
//!                        bit (sp * num_slots + slot)
//! ```

use thiserror::Error;

/// What a slot offset is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotBase {
    /// The caller's stack pointer at entry (arg homes).
    CallerSp,
    /// The current stack pointer after the prolog.
    Sp,
    /// The established frame register.
    FramePointer,
}

const SLOT_BASE_MASK: u8 = 0x3;
const SLOT_FLAG_INTERIOR: u8 = 0x10;
const SLOT_FLAG_PINNED: u8 = 0x20;

/// One stack slot the collector may have to visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSlot {
    /// Base register of the address computation.
    pub base: SlotBase,
    /// Signed byte offset from the base.
    pub offset: i32,
    /// The slot may hold an interior pointer.
    pub is_interior: bool,
    /// The referent must not move (no-op for this non-moving collector,
    /// carried for completeness).
    pub is_pinned: bool,
}

/// Codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GcInfoError {
    /// The blob ended mid-value.
    #[error("truncated GCInfo blob")]
    Truncated,
    /// A varint ran past its maximum width.
    #[error("malformed varint in GCInfo blob")]
    BadVarint,
    /// A slot byte carried an unknown base.
    #[error("unknown slot base {0}")]
    BadSlotBase(u8),
}

fn write_uleb(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let b = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(b);
            return;
        }
        out.push(b | 0x80);
    }
}

fn write_sleb(out: &mut Vec<u8>, mut v: i64) {
    loop {
        let b = (v & 0x7F) as u8;
        v >>= 7;
        let sign = b & 0x40 != 0;
        if (v == 0 && !sign) || (v == -1 && sign) {
            out.push(b);
            return;
        }
        out.push(b | 0x80);
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, GcInfoError> {
        let b = *self.bytes.get(self.pos).ok_or(GcInfoError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn uleb(&mut self) -> Result<u64, GcInfoError> {
        let mut v = 0u64;
        let mut shift = 0;
        loop {
            let b = self.u8()?;
            v |= ((b & 0x7F) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift > 63 {
                return Err(GcInfoError::BadVarint);
            }
        }
    }

    fn sleb(&mut self) -> Result<i64, GcInfoError> {
        let mut v = 0i64;
        let mut shift = 0;
        loop {
            let b = self.u8()?;
            v |= ((b & 0x7F) as i64) << shift;
            shift += 7;
            if b & 0x80 == 0 {
                if shift < 64 && b & 0x40 != 0 {
                    v |= -1i64 << shift;
                }
                return Ok(v);
            }
            if shift > 63 {
                return Err(GcInfoError::BadVarint);
            }
        }
    }
}

/// Accumulates a method's GC metadata during compilation.
pub struct GcInfoEncoder {
    code_length: u32,
    has_frame_pointer: bool,
    slots: Vec<GcSlot>,
    safe_points: Vec<u32>,
    /// (safe point index, slot index) pairs set live.
    live: Vec<(u32, u32)>,
}

impl GcInfoEncoder {
    /// Start encoding for a method of `code_length` bytes.
    pub fn new(code_length: u32, has_frame_pointer: bool) -> Self {
        Self {
            code_length,
            has_frame_pointer,
            slots: Vec::new(),
            safe_points: Vec::new(),
            live: Vec::new(),
        }
    }

    /// Register a slot; returns its index. Registering the same slot twice
    /// returns the existing index.
    pub fn add_slot(&mut self, slot: GcSlot) -> u32 {
        if let Some(i) = self.slots.iter().position(|s| s == &slot) {
            return i as u32;
        }
        self.slots.push(slot);
        (self.slots.len() - 1) as u32
    }

    /// Register a safe point at a native offset; returns its index. Offsets
    /// must be added in ascending order.
    pub fn add_safe_point(&mut self, native_offset: u32) -> u32 {
        debug_assert!(
            self.safe_points.last().map_or(true, |&p| p < native_offset),
            "safe points must be strictly ascending"
        );
        self.safe_points.push(native_offset);
        (self.safe_points.len() - 1) as u32
    }

    /// Mark `slot` live at `safe_point`.
    pub fn set_live(&mut self, safe_point: u32, slot: u32) {
        self.live.push((safe_point, slot));
    }

    /// Number of safe points registered so far.
    pub fn safe_point_count(&self) -> u32 {
        self.safe_points.len() as u32
    }

    /// Serialize.
    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_uleb(&mut out, self.code_length as u64);
        out.push(self.has_frame_pointer as u8);
        write_uleb(&mut out, self.slots.len() as u64);
        write_uleb(&mut out, self.safe_points.len() as u64);

        for slot in &self.slots {
            let mut b = match slot.base {
                SlotBase::CallerSp => 0u8,
                SlotBase::Sp => 1,
                SlotBase::FramePointer => 2,
            };
            if slot.is_interior {
                b |= SLOT_FLAG_INTERIOR;
            }
            if slot.is_pinned {
                b |= SLOT_FLAG_PINNED;
            }
            out.push(b);
            write_sleb(&mut out, slot.offset as i64);
        }

        let mut prev = 0u32;
        for (i, &sp) in self.safe_points.iter().enumerate() {
            if i == 0 {
                write_uleb(&mut out, sp as u64);
            } else {
                write_uleb(&mut out, (sp - prev) as u64);
            }
            prev = sp;
        }

        let bits = self.slots.len() * self.safe_points.len();
        let mut bitmap = vec![0u8; bits.div_ceil(8)];
        for &(sp, slot) in &self.live {
            let bit = sp as usize * self.slots.len() + slot as usize;
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        out.extend_from_slice(&bitmap);
        out
    }
}

/// Decoded GCInfo with random-access queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcInfo {
    code_length: u32,
    has_frame_pointer: bool,
    slots: Vec<GcSlot>,
    safe_points: Vec<u32>,
    bitmap: Vec<u8>,
}

impl GcInfo {
    /// Stream-forward decode of a blob produced by [`GcInfoEncoder`].
    pub fn decode(bytes: &[u8]) -> Result<Self, GcInfoError> {
        let mut r = Reader { bytes, pos: 0 };
        let code_length = r.uleb()? as u32;
        let has_frame_pointer = r.u8()? & 1 != 0;
        let num_slots = r.uleb()? as usize;
        let num_safe_points = r.uleb()? as usize;

        let mut slots = Vec::with_capacity(num_slots);
        for _ in 0..num_slots {
            let b = r.u8()?;
            let base = match b & SLOT_BASE_MASK {
                0 => SlotBase::CallerSp,
                1 => SlotBase::Sp,
                2 => SlotBase::FramePointer,
                other => return Err(GcInfoError::BadSlotBase(other)),
            };
            let offset = r.sleb()? as i32;
            slots.push(GcSlot {
                base,
                offset,
                is_interior: b & SLOT_FLAG_INTERIOR != 0,
                is_pinned: b & SLOT_FLAG_PINNED != 0,
            });
        }

        let mut safe_points = Vec::with_capacity(num_safe_points);
        let mut prev = 0u32;
        for i in 0..num_safe_points {
            let v = r.uleb()? as u32;
            let abs = if i == 0 { v } else { prev + v };
            safe_points.push(abs);
            prev = abs;
        }

        let bits = num_slots * num_safe_points;
        let len = bits.div_ceil(8);
        if bytes.len() < r.pos + len {
            return Err(GcInfoError::Truncated);
        }
        let bitmap = bytes[r.pos..r.pos + len].to_vec();

        Ok(Self {
            code_length,
            has_frame_pointer,
            slots,
            safe_points,
            bitmap,
        })
    }

    /// Code length recorded at encode time.
    pub fn code_length(&self) -> u32 {
        self.code_length
    }

    /// Whether the method established a frame pointer.
    pub fn has_frame_pointer(&self) -> bool {
        self.has_frame_pointer
    }

    /// Number of slots.
    pub fn num_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of safe points.
    pub fn num_safe_points(&self) -> u32 {
        self.safe_points.len() as u32
    }

    /// Native offset of safe point `i`.
    pub fn safe_point_offset(&self, i: u32) -> u32 {
        self.safe_points[i as usize]
    }

    /// Slot `i`.
    pub fn slot(&self, i: u32) -> GcSlot {
        self.slots[i as usize]
    }

    /// Whether `slot` is live at `safe_point`.
    pub fn is_slot_live(&self, safe_point: u32, slot: u32) -> bool {
        let bit = safe_point as usize * self.slots.len() + slot as usize;
        self.bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Index of the safe point with the largest offset `<= native_offset`,
    /// the one whose live set describes a frame stopped there.
    pub fn safe_point_at_or_before(&self, native_offset: u32) -> Option<u32> {
        let idx = self
            .safe_points
            .partition_point(|&p| p <= native_offset);
        if idx == 0 {
            None
        } else {
            Some((idx - 1) as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp_slot(offset: i32) -> GcSlot {
        GcSlot {
            base: SlotBase::FramePointer,
            offset,
            is_interior: false,
            is_pinned: false,
        }
    }

    #[test]
    fn test_roundtrip_basic() {
        // The S11 shape: two FP slots, three safe points, all live.
        let mut enc = GcInfoEncoder::new(100, true);
        let s0 = enc.add_slot(fp_slot(-8));
        let s1 = enc.add_slot(fp_slot(-16));
        for (i, off) in [20u32, 45, 80].into_iter().enumerate() {
            let sp = enc.add_safe_point(off);
            assert_eq!(sp, i as u32);
            enc.set_live(sp, s0);
            enc.set_live(sp, s1);
        }

        let blob = enc.finish();
        let dec = GcInfo::decode(&blob).unwrap();
        assert_eq!(dec.code_length(), 100);
        assert!(dec.has_frame_pointer());
        assert_eq!(dec.num_slots(), 2);
        assert_eq!(dec.num_safe_points(), 3);
        assert_eq!(dec.slot(0), fp_slot(-8));
        assert_eq!(dec.slot(1), fp_slot(-16));
        assert_eq!(
            (0..3).map(|i| dec.safe_point_offset(i)).collect::<Vec<_>>(),
            vec![20, 45, 80]
        );
        for sp in 0..3 {
            for slot in 0..2 {
                assert!(dec.is_slot_live(sp, slot));
            }
        }
    }

    #[test]
    fn test_sparse_liveness() {
        let mut enc = GcInfoEncoder::new(64, true);
        let a = enc.add_slot(fp_slot(-8));
        let b = enc.add_slot(fp_slot(-24));
        let c = enc.add_slot(GcSlot {
            base: SlotBase::CallerSp,
            offset: 16,
            is_interior: true,
            is_pinned: false,
        });
        let sp0 = enc.add_safe_point(10);
        let sp1 = enc.add_safe_point(30);
        enc.set_live(sp0, a);
        enc.set_live(sp1, b);
        enc.set_live(sp1, c);

        let dec = GcInfo::decode(&enc.finish()).unwrap();
        assert!(dec.is_slot_live(0, a));
        assert!(!dec.is_slot_live(0, b));
        assert!(!dec.is_slot_live(0, c));
        assert!(!dec.is_slot_live(1, a));
        assert!(dec.is_slot_live(1, b));
        assert!(dec.is_slot_live(1, c));
        assert!(dec.slot(c).is_interior);
        assert!(!dec.slot(c).is_pinned);
        assert_eq!(dec.slot(c).base, SlotBase::CallerSp);
    }

    #[test]
    fn test_slot_dedup() {
        let mut enc = GcInfoEncoder::new(16, true);
        let a = enc.add_slot(fp_slot(-8));
        let b = enc.add_slot(fp_slot(-8));
        assert_eq!(a, b);
        let c = enc.add_slot(fp_slot(-16));
        assert_ne!(a, c);
    }

    #[test]
    fn test_safe_point_at_or_before() {
        let mut enc = GcInfoEncoder::new(100, false);
        enc.add_safe_point(20);
        enc.add_safe_point(45);
        enc.add_safe_point(80);
        let dec = GcInfo::decode(&enc.finish()).unwrap();

        assert_eq!(dec.safe_point_at_or_before(19), None);
        assert_eq!(dec.safe_point_at_or_before(20), Some(0));
        assert_eq!(dec.safe_point_at_or_before(44), Some(0));
        assert_eq!(dec.safe_point_at_or_before(45), Some(1));
        assert_eq!(dec.safe_point_at_or_before(79), Some(1));
        assert_eq!(dec.safe_point_at_or_before(1000), Some(2));
    }

    #[test]
    fn test_empty_info() {
        let enc = GcInfoEncoder::new(8, false);
        let dec = GcInfo::decode(&enc.finish()).unwrap();
        assert_eq!(dec.num_slots(), 0);
        assert_eq!(dec.num_safe_points(), 0);
        assert!(!dec.has_frame_pointer());
    }

    #[test]
    fn test_truncated_blob() {
        let mut enc = GcInfoEncoder::new(100, true);
        let s = enc.add_slot(fp_slot(-8));
        let sp = enc.add_safe_point(50);
        enc.set_live(sp, s);
        let mut blob = enc.finish();
        blob.pop();
        assert_eq!(GcInfo::decode(&blob), Err(GcInfoError::Truncated));
    }

    #[test]
    fn test_large_offsets_delta_encode() {
        let mut enc = GcInfoEncoder::new(1 << 20, true);
        enc.add_slot(fp_slot(-1024));
        enc.add_slot(fp_slot(4096));
        let mut offs = Vec::new();
        let mut cur = 3u32;
        for _ in 0..50 {
            offs.push(cur);
            enc.add_safe_point(cur);
            cur += 127; // just under the one-byte delta limit
        }
        let dec = GcInfo::decode(&enc.finish()).unwrap();
        for (i, &o) in offs.iter().enumerate() {
            assert_eq!(dec.safe_point_offset(i as u32), o);
        }
        assert_eq!(dec.slot(0).offset, -1024);
        assert_eq!(dec.slot(1).offset, 4096);
    }
}
