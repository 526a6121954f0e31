//! Register context rolled forward by execution and backward by the unwinder

/// Register numbering used by unwind-code `op_info` nibbles.
///
/// The values are the hardware encodings, so `gpr[op_info]` addresses the
/// register an unwind code names.
pub mod gpr {
    #![allow(missing_docs)]
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
    pub const R8: usize = 8;
    pub const R9: usize = 9;
    pub const R10: usize = 10;
    pub const R11: usize = 11;
    pub const R12: usize = 12;
    pub const R13: usize = 13;
    pub const R14: usize = 14;
    pub const R15: usize = 15;
}

/// A snapshot of the register state at one instruction boundary.
///
/// The layout is `repr(C)` with fixed field order because the engine's
/// capture/restore stubs address fields by byte offset: `rip` at 0, the
/// GPR array at 8 (indexed by hardware encoding), the XMM array at 144.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct Context {
    /// Instruction pointer.
    pub rip: u64,
    /// General-purpose registers, indexed by hardware encoding (see [`gpr`]).
    pub gpr: [u64; 16],
    _pad: u64,
    /// XMM registers, low-to-high lanes packed as one `u128` each.
    pub xmm: [u128; 16],
}

/// Byte offset of `rip` within [`Context`].
pub const CTX_RIP: usize = 0;
/// Byte offset of `gpr[0]` within [`Context`]; register `i` is at `8 + 8*i`.
pub const CTX_GPR: usize = 8;
/// Byte offset of `xmm[0]` within [`Context`].
pub const CTX_XMM: usize = 144;

impl Context {
    /// An all-zero context.
    pub fn zeroed() -> Self {
        Self {
            rip: 0,
            gpr: [0; 16],
            _pad: 0,
            xmm: [0; 16],
        }
    }

    /// Stack pointer.
    #[inline]
    pub fn rsp(&self) -> u64 {
        self.gpr[gpr::RSP]
    }

    /// Set the stack pointer.
    #[inline]
    pub fn set_rsp(&mut self, v: u64) {
        self.gpr[gpr::RSP] = v;
    }

    /// Frame pointer.
    #[inline]
    pub fn rbp(&self) -> u64 {
        self.gpr[gpr::RBP]
    }

    /// Set the frame pointer.
    #[inline]
    pub fn set_rbp(&mut self, v: u64) {
        self.gpr[gpr::RBP] = v;
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("rip", &format_args!("{:#x}", self.rip))
            .field("rsp", &format_args!("{:#x}", self.rsp()))
            .field("rbp", &format_args!("{:#x}", self.rbp()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_offsets_match_stub_constants() {
        assert_eq!(core::mem::offset_of!(Context, rip), CTX_RIP);
        assert_eq!(core::mem::offset_of!(Context, gpr), CTX_GPR);
        assert_eq!(core::mem::offset_of!(Context, xmm), CTX_XMM);
        assert_eq!(core::mem::align_of::<Context>(), 16);
    }

    #[test]
    fn test_rsp_rbp_alias_gpr_slots() {
        let mut ctx = Context::zeroed();
        ctx.set_rsp(0x1000);
        ctx.set_rbp(0x2000);
        assert_eq!(ctx.gpr[gpr::RSP], 0x1000);
        assert_eq!(ctx.gpr[gpr::RBP], 0x2000);
    }
}
