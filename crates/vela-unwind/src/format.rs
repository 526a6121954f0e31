//! Bit-exact `RUNTIME_FUNCTION` and `UNWIND_INFO` wire formats
//!
//! See <https://docs.microsoft.com/en-us/cpp/build/exception-handling-x64>.
//! Only the operations the runtime emits or replays are represented.

use crate::UnwindError;
use bitflags::bitflags;

/// Maximum (inclusive) size of a "small" stack allocation.
const SMALL_ALLOC_MAX_SIZE: u32 = 128;
/// Maximum (inclusive) size of a "large" stack allocation representable in a
/// single scaled 16-bit slot.
const LARGE_ALLOC_16BIT_MAX_SIZE: u32 = 524_280;

/// Unwind operation numbers as they appear in the low nibble of an
/// `UNWIND_CODE` slot.
mod op {
    pub const PUSH_NONVOL: u8 = 0;
    pub const ALLOC_LARGE: u8 = 1;
    pub const ALLOC_SMALL: u8 = 2;
    pub const SET_FPREG: u8 = 3;
    pub const SAVE_NONVOL: u8 = 4;
    pub const SAVE_NONVOL_FAR: u8 = 5;
    pub const SAVE_XMM128: u8 = 8;
    pub const SAVE_XMM128_FAR: u8 = 9;
    pub const PUSH_MACHFRAME: u8 = 10;
}

bitflags! {
    /// Flag bits from byte 0 (bits 3..7) of an `UNWIND_INFO`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnwindFlags: u8 {
        /// The function has an exception handler.
        const EHANDLER = 0x1;
        /// The function has a termination handler.
        const UHANDLER = 0x2;
        /// This info chains to another `RUNTIME_FUNCTION`.
        const CHAININFO = 0x4;
    }
}

/// One function's entry in a function table: three little-endian u32 RVAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    /// RVA of the first instruction.
    pub begin_rva: u32,
    /// RVA one past the last instruction.
    pub end_rva: u32,
    /// RVA of the `UNWIND_INFO` blob.
    pub unwind_info_rva: u32,
}

impl RuntimeFunction {
    /// Serialized size in bytes.
    pub const SIZE: usize = 12;

    /// Write the three RVAs little-endian.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.begin_rva.to_le_bytes());
        out.extend_from_slice(&self.end_rva.to_le_bytes());
        out.extend_from_slice(&self.unwind_info_rva.to_le_bytes());
    }

    /// Parse from a 12-byte record.
    pub fn parse(bytes: &[u8]) -> Result<Self, UnwindError> {
        if bytes.len() < Self::SIZE {
            return Err(UnwindError::Truncated);
        }
        let rd = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(Self {
            begin_rva: rd(0),
            end_rva: rd(4),
            unwind_info_rva: rd(8),
        })
    }
}

/// One prolog operation, in its decoded form.
///
/// `offset` is the prolog offset of the byte *after* the instruction the code
/// describes, as the format requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindCode {
    /// `push <nonvolatile gpr>`.
    PushNonvol {
        /// Prolog offset past the push.
        offset: u8,
        /// Hardware register number.
        reg: u8,
    },
    /// `sub rsp, size` (any size; the encoding is chosen on emit).
    Alloc {
        /// Prolog offset past the sub.
        offset: u8,
        /// Allocation size in bytes, multiple of 8.
        size: u32,
    },
    /// `lea fp, [rsp + 16*fp_offset]`, establishing the frame register.
    SetFpReg {
        /// Prolog offset past the lea/mov.
        offset: u8,
    },
    /// `mov [rsp + stack_offset], <nonvolatile gpr>`.
    SaveNonvol {
        /// Prolog offset past the store.
        offset: u8,
        /// Hardware register number.
        reg: u8,
        /// Byte offset from the post-prolog RSP.
        stack_offset: u32,
    },
    /// `movaps [rsp + stack_offset], xmmN`.
    SaveXmm128 {
        /// Prolog offset past the store.
        offset: u8,
        /// XMM register number.
        reg: u8,
        /// Byte offset from the post-prolog RSP.
        stack_offset: u32,
    },
    /// A hardware interrupt machine frame pushed before the prolog.
    PushMachFrame {
        /// Prolog offset (0 or the offset past an error-code push).
        offset: u8,
        /// Whether an error code sits below the frame.
        has_error_code: bool,
    },
}

impl UnwindCode {
    /// Prolog offset of this code.
    pub fn offset(&self) -> u8 {
        match *self {
            UnwindCode::PushNonvol { offset, .. }
            | UnwindCode::Alloc { offset, .. }
            | UnwindCode::SetFpReg { offset }
            | UnwindCode::SaveNonvol { offset, .. }
            | UnwindCode::SaveXmm128 { offset, .. }
            | UnwindCode::PushMachFrame { offset, .. } => offset,
        }
    }

    /// Number of 2-byte slots this code occupies when serialized.
    pub fn slot_count(&self) -> usize {
        match *self {
            UnwindCode::Alloc { size, .. } => {
                if size <= SMALL_ALLOC_MAX_SIZE {
                    1
                } else if size <= LARGE_ALLOC_16BIT_MAX_SIZE {
                    2
                } else {
                    3
                }
            }
            UnwindCode::SaveNonvol { stack_offset, .. } => {
                if stack_offset / 8 <= u16::MAX as u32 {
                    2
                } else {
                    3
                }
            }
            UnwindCode::SaveXmm128 { stack_offset, .. } => {
                if stack_offset / 16 <= u16::MAX as u32 {
                    2
                } else {
                    3
                }
            }
            _ => 1,
        }
    }

    fn emit(&self, out: &mut Vec<u8>) -> Result<(), UnwindError> {
        match *self {
            UnwindCode::PushNonvol { offset, reg } => {
                out.push(offset);
                out.push((reg << 4) | op::PUSH_NONVOL);
            }
            UnwindCode::Alloc { offset, size } => {
                if size < 8 || size % 8 != 0 {
                    return Err(UnwindError::Unencodable("alloc size must be 8*n"));
                }
                out.push(offset);
                if size <= SMALL_ALLOC_MAX_SIZE {
                    out.push(((((size - 8) / 8) as u8) << 4) | op::ALLOC_SMALL);
                } else if size <= LARGE_ALLOC_16BIT_MAX_SIZE {
                    out.push(op::ALLOC_LARGE);
                    out.extend_from_slice(&((size / 8) as u16).to_le_bytes());
                } else {
                    out.push((1 << 4) | op::ALLOC_LARGE);
                    out.extend_from_slice(&size.to_le_bytes());
                }
            }
            UnwindCode::SetFpReg { offset } => {
                out.push(offset);
                out.push(op::SET_FPREG);
            }
            UnwindCode::SaveNonvol {
                offset,
                reg,
                stack_offset,
            } => {
                out.push(offset);
                let scaled = stack_offset / 8;
                if stack_offset % 8 != 0 {
                    return Err(UnwindError::Unencodable("save offset must be 8*n"));
                }
                if scaled <= u16::MAX as u32 {
                    out.push((reg << 4) | op::SAVE_NONVOL);
                    out.extend_from_slice(&(scaled as u16).to_le_bytes());
                } else {
                    out.push((reg << 4) | op::SAVE_NONVOL_FAR);
                    out.extend_from_slice(&stack_offset.to_le_bytes());
                }
            }
            UnwindCode::SaveXmm128 {
                offset,
                reg,
                stack_offset,
            } => {
                out.push(offset);
                let scaled = stack_offset / 16;
                if stack_offset % 16 != 0 {
                    return Err(UnwindError::Unencodable("xmm save offset must be 16*n"));
                }
                if scaled <= u16::MAX as u32 {
                    out.push((reg << 4) | op::SAVE_XMM128);
                    out.extend_from_slice(&(scaled as u16).to_le_bytes());
                } else {
                    out.push((reg << 4) | op::SAVE_XMM128_FAR);
                    out.extend_from_slice(&stack_offset.to_le_bytes());
                }
            }
            UnwindCode::PushMachFrame {
                offset,
                has_error_code,
            } => {
                out.push(offset);
                out.push(((has_error_code as u8) << 4) | op::PUSH_MACHFRAME);
            }
        }
        Ok(())
    }
}

/// A decoded `UNWIND_INFO` blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindInfo {
    /// Flag bits.
    pub flags: UnwindFlags,
    /// Prolog size in bytes.
    pub prolog_size: u8,
    /// Frame register (hardware number) and its scaled offset, when set.
    pub frame_register: Option<(u8, u8)>,
    /// Unwind codes in prolog order (ascending offset). Serialization
    /// reverses them as the format requires.
    pub codes: Vec<UnwindCode>,
    /// Exception-handler RVA, present when EHANDLER or UHANDLER is set.
    pub handler_rva: Option<u32>,
    /// Language-specific handler data appended after the handler RVA.
    pub handler_data: Vec<u8>,
}

impl UnwindInfo {
    /// New info with no flags, no frame register and no codes.
    pub fn new(prolog_size: u8) -> Self {
        Self {
            flags: UnwindFlags::empty(),
            prolog_size,
            frame_register: None,
            codes: Vec::new(),
            handler_rva: None,
            handler_data: Vec::new(),
        }
    }

    fn slot_count(&self) -> usize {
        self.codes.iter().map(UnwindCode::slot_count).sum()
    }

    /// Serialized size in bytes.
    pub fn emit_size(&self) -> usize {
        let slots = self.slot_count();
        let padded = (slots + 1) & !1;
        let mut size = 4 + padded * 2;
        if self
            .flags
            .intersects(UnwindFlags::EHANDLER | UnwindFlags::UHANDLER)
        {
            size += 4 + self.handler_data.len();
        }
        size
    }

    /// Serialize, appending to `out`.
    pub fn emit(&self, out: &mut Vec<u8>) -> Result<(), UnwindError> {
        const VERSION: u8 = 1;
        let start = out.len();
        let slots = self.slot_count();
        if slots > 255 {
            return Err(UnwindError::Unencodable("more than 255 unwind slots"));
        }

        out.push((self.flags.bits() << 3) | VERSION);
        out.push(self.prolog_size);
        out.push(slots as u8);
        match self.frame_register {
            Some((reg, fp_offset)) => out.push((fp_offset << 4) | reg),
            None => out.push(0),
        }

        // Codes are stored with descending prolog offsets.
        for code in self.codes.iter().rev() {
            code.emit(out)?;
        }
        if slots % 2 == 1 {
            out.extend_from_slice(&[0, 0]);
        }

        if self
            .flags
            .intersects(UnwindFlags::EHANDLER | UnwindFlags::UHANDLER)
        {
            out.extend_from_slice(&self.handler_rva.unwrap_or(0).to_le_bytes());
            out.extend_from_slice(&self.handler_data);
        }

        debug_assert_eq!(out.len() - start, self.emit_size());
        Ok(())
    }

    /// Parse a blob. `handler_data` is filled with every byte following the
    /// handler RVA (the caller decides how much of the tail is meaningful).
    pub fn parse(bytes: &[u8]) -> Result<Self, UnwindError> {
        if bytes.len() < 4 {
            return Err(UnwindError::Truncated);
        }
        let version = bytes[0] & 0x7;
        if version != 1 {
            return Err(UnwindError::BadVersion(version));
        }
        let flags = UnwindFlags::from_bits_truncate(bytes[0] >> 3);
        let prolog_size = bytes[1];
        let slot_count = bytes[2] as usize;
        let frame_byte = bytes[3];
        let frame_register = if frame_byte & 0xF != 0 {
            Some((frame_byte & 0xF, frame_byte >> 4))
        } else {
            None
        };

        let slots_end = 4 + slot_count * 2;
        if bytes.len() < slots_end {
            return Err(UnwindError::Truncated);
        }

        let mut codes = Vec::new();
        let mut i = 0;
        while i < slot_count {
            let at = 4 + i * 2;
            let offset = bytes[at];
            let opcode = bytes[at + 1] & 0xF;
            let info = bytes[at + 1] >> 4;
            let mut used = 1;
            let read_u16 = |slot: usize| -> Result<u16, UnwindError> {
                let p = 4 + slot * 2;
                if p + 2 > slots_end {
                    return Err(UnwindError::Truncated);
                }
                Ok(u16::from_le_bytes([bytes[p], bytes[p + 1]]))
            };
            let read_u32 = |slot: usize| -> Result<u32, UnwindError> {
                let lo = read_u16(slot)? as u32;
                let hi = read_u16(slot + 1)? as u32;
                Ok(lo | (hi << 16))
            };
            let code = match opcode {
                op::PUSH_NONVOL => UnwindCode::PushNonvol { offset, reg: info },
                op::ALLOC_SMALL => UnwindCode::Alloc {
                    offset,
                    size: (info as u32) * 8 + 8,
                },
                op::ALLOC_LARGE => {
                    if info == 0 {
                        used = 2;
                        UnwindCode::Alloc {
                            offset,
                            size: read_u16(i + 1)? as u32 * 8,
                        }
                    } else {
                        used = 3;
                        UnwindCode::Alloc {
                            offset,
                            size: read_u32(i + 1)?,
                        }
                    }
                }
                op::SET_FPREG => UnwindCode::SetFpReg { offset },
                op::SAVE_NONVOL => {
                    used = 2;
                    UnwindCode::SaveNonvol {
                        offset,
                        reg: info,
                        stack_offset: read_u16(i + 1)? as u32 * 8,
                    }
                }
                op::SAVE_NONVOL_FAR => {
                    used = 3;
                    UnwindCode::SaveNonvol {
                        offset,
                        reg: info,
                        stack_offset: read_u32(i + 1)?,
                    }
                }
                op::SAVE_XMM128 => {
                    used = 2;
                    UnwindCode::SaveXmm128 {
                        offset,
                        reg: info,
                        stack_offset: read_u16(i + 1)? as u32 * 16,
                    }
                }
                op::SAVE_XMM128_FAR => {
                    used = 3;
                    UnwindCode::SaveXmm128 {
                        offset,
                        reg: info,
                        stack_offset: read_u32(i + 1)?,
                    }
                }
                op::PUSH_MACHFRAME => UnwindCode::PushMachFrame {
                    offset,
                    has_error_code: info != 0,
                },
                other => return Err(UnwindError::BadOpcode(other)),
            };
            codes.push(code);
            i += used;
        }

        // Stored order is reverse prolog order; normalize to prolog order.
        codes.reverse();

        let padded_end = 4 + ((slot_count + 1) & !1) * 2;
        let (handler_rva, handler_data) =
            if flags.intersects(UnwindFlags::EHANDLER | UnwindFlags::UHANDLER) {
                if bytes.len() < padded_end + 4 {
                    return Err(UnwindError::Truncated);
                }
                let rva = u32::from_le_bytes([
                    bytes[padded_end],
                    bytes[padded_end + 1],
                    bytes[padded_end + 2],
                    bytes[padded_end + 3],
                ]);
                (Some(rva), bytes[padded_end + 4..].to_vec())
            } else {
                (None, Vec::new())
            };

        Ok(Self {
            flags,
            prolog_size,
            frame_register,
            codes,
            handler_rva,
            handler_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::gpr;

    fn emit(info: &UnwindInfo) -> Vec<u8> {
        let mut v = Vec::new();
        info.emit(&mut v).unwrap();
        v
    }

    #[test]
    fn test_runtime_function_roundtrip() {
        let rf = RuntimeFunction {
            begin_rva: 0x1000,
            end_rva: 0x1040,
            unwind_info_rva: 0x2000,
        };
        let mut bytes = Vec::new();
        rf.write(&mut bytes);
        assert_eq!(bytes.len(), RuntimeFunction::SIZE);
        assert_eq!(
            bytes,
            [0x00, 0x10, 0, 0, 0x40, 0x10, 0, 0, 0x00, 0x20, 0, 0]
        );
        assert_eq!(RuntimeFunction::parse(&bytes).unwrap(), rf);
    }

    #[test]
    fn test_small_alloc_emission() {
        // push rbp; mov rbp, rsp; sub rsp, 96: the standard jit prolog.
        let mut info = UnwindInfo::new(9);
        info.frame_register = Some((gpr::RBP as u8, 0));
        info.codes = vec![
            UnwindCode::PushNonvol {
                offset: 2,
                reg: gpr::RBP as u8,
            },
            UnwindCode::SetFpReg { offset: 5 },
            UnwindCode::Alloc { offset: 9, size: 96 },
        ];
        let bytes = emit(&info);
        assert_eq!(
            bytes,
            [
                0x01, // version 1, no flags
                0x09, // prolog size
                0x03, // three slots
                0x05, // frame register rbp, offset 0
                0x09, 0xB2, // alloc small, (0xB*8)+8 = 96
                0x05, 0x03, // set fpreg
                0x02, 0x50, // push rbp
                0x00, 0x00, // pad to dword
            ]
        );
        assert_eq!(UnwindInfo::parse(&bytes).unwrap().codes, info.codes);
    }

    #[test]
    fn test_medium_alloc_emission() {
        let mut info = UnwindInfo::new(27);
        info.frame_register = Some((gpr::RBP as u8, 0));
        info.codes = vec![
            UnwindCode::PushNonvol {
                offset: 2,
                reg: gpr::RBP as u8,
            },
            UnwindCode::SetFpReg { offset: 5 },
            UnwindCode::Alloc {
                offset: 27,
                size: 10032,
            },
        ];
        let bytes = emit(&info);
        assert_eq!(
            bytes,
            [
                0x01, 0x1B, 0x04, 0x05, //
                0x1B, 0x01, 0xE6, 0x04, // large alloc, 0x04E6 * 8 = 10032
                0x05, 0x03, //
                0x02, 0x50, //
            ]
        );
        let parsed = UnwindInfo::parse(&bytes).unwrap();
        assert_eq!(parsed.codes, info.codes);
        assert_eq!(parsed.prolog_size, 27);
    }

    #[test]
    fn test_huge_alloc_emission() {
        let mut info = UnwindInfo::new(30);
        info.codes = vec![UnwindCode::Alloc {
            offset: 30,
            size: 1_000_032,
        }];
        let bytes = emit(&info);
        assert_eq!(bytes[4], 30);
        assert_eq!(bytes[5], 0x11); // large alloc, unscaled form
        assert_eq!(&bytes[6..10], &1_000_032u32.to_le_bytes());
        assert_eq!(UnwindInfo::parse(&bytes).unwrap().codes, info.codes);
    }

    #[test]
    fn test_save_nonvol_and_xmm() {
        let mut info = UnwindInfo::new(20);
        info.codes = vec![
            UnwindCode::Alloc {
                offset: 4,
                size: 64,
            },
            UnwindCode::SaveNonvol {
                offset: 10,
                reg: gpr::R12 as u8,
                stack_offset: 40,
            },
            UnwindCode::SaveXmm128 {
                offset: 16,
                reg: 6,
                stack_offset: 16,
            },
        ];
        let bytes = emit(&info);
        let parsed = UnwindInfo::parse(&bytes).unwrap();
        assert_eq!(parsed.codes, info.codes);
    }

    #[test]
    fn test_handler_data_roundtrip() {
        let mut info = UnwindInfo::new(4);
        info.flags = UnwindFlags::EHANDLER;
        info.handler_rva = Some(0xCAFE);
        info.handler_data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        info.codes = vec![UnwindCode::PushNonvol {
            offset: 2,
            reg: gpr::RBP as u8,
        }];
        let bytes = emit(&info);
        let parsed = UnwindInfo::parse(&bytes).unwrap();
        assert_eq!(parsed.flags, UnwindFlags::EHANDLER);
        assert_eq!(parsed.handler_rva, Some(0xCAFE));
        assert_eq!(parsed.handler_data, info.handler_data);
    }

    #[test]
    fn test_machframe_roundtrip() {
        let mut info = UnwindInfo::new(0);
        info.codes = vec![UnwindCode::PushMachFrame {
            offset: 0,
            has_error_code: true,
        }];
        let bytes = emit(&info);
        assert_eq!(bytes[5], (1 << 4) | 10);
        assert_eq!(UnwindInfo::parse(&bytes).unwrap().codes, info.codes);
    }

    #[test]
    fn test_bad_version_rejected() {
        let bytes = [0x02u8, 0, 0, 0];
        assert_eq!(
            UnwindInfo::parse(&bytes),
            Err(UnwindError::BadVersion(2))
        );
    }

    #[test]
    fn test_odd_alloc_rejected() {
        let mut info = UnwindInfo::new(4);
        info.codes = vec![UnwindCode::Alloc {
            offset: 4,
            size: 12,
        }];
        let mut out = Vec::new();
        assert!(info.emit(&mut out).is_err());
    }
}
