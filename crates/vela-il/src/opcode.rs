//! IL opcode enumeration
//!
//! One-byte opcodes live in [`Opcode`]; the `0xFE`-prefixed page lives in
//! [`ExtOpcode`]. Operand bytes (tokens, immediates, branch displacements)
//! follow the opcode in the instruction stream and are read by the consumer
//! through [`crate::IlCursor`]; the enums here carry no payload so the JIT
//! can dispatch on a bare discriminant.
//!
//! Opcodes are organized into categories:
//! - 0x00-0x13: arguments, locals, stack housekeeping
//! - 0x14-0x23: constants
//! - 0x25-0x45: stack ops, calls, branches
//! - 0x46-0x57: indirect loads/stores
//! - 0x58-0x6E: arithmetic and conversions
//! - 0x6F-0xA5: object model (fields, arrays, casts, boxing)
//! - 0xB3-0xE0: overflow conversions, overflow arithmetic, EH exits
//! - 0xFE xx:   extended page (comparisons, function pointers, blocks, EH)

use crate::{IlCursor, IlError};

/// Prefix byte that escapes to the extended opcode page.
pub const EXT_PREFIX: u8 = 0xFE;

/// One-byte IL opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    // ===== Arguments, locals, stack housekeeping (0x00-0x13) =====
    Nop = 0x00,
    Break = 0x01,
    LdArg0 = 0x02,
    LdArg1 = 0x03,
    LdArg2 = 0x04,
    LdArg3 = 0x05,
    LdLoc0 = 0x06,
    LdLoc1 = 0x07,
    LdLoc2 = 0x08,
    LdLoc3 = 0x09,
    StLoc0 = 0x0A,
    StLoc1 = 0x0B,
    StLoc2 = 0x0C,
    StLoc3 = 0x0D,
    /// Operand: u8 argument index.
    LdArgS = 0x0E,
    /// Operand: u8 argument index.
    LdArgaS = 0x0F,
    /// Operand: u8 argument index.
    StArgS = 0x10,
    /// Operand: u8 local index.
    LdLocS = 0x11,
    /// Operand: u8 local index.
    LdLocaS = 0x12,
    /// Operand: u8 local index.
    StLocS = 0x13,

    // ===== Constants (0x14-0x23) =====
    LdNull = 0x14,
    LdcI4M1 = 0x15,
    LdcI40 = 0x16,
    LdcI41 = 0x17,
    LdcI42 = 0x18,
    LdcI43 = 0x19,
    LdcI44 = 0x1A,
    LdcI45 = 0x1B,
    LdcI46 = 0x1C,
    LdcI47 = 0x1D,
    LdcI48 = 0x1E,
    /// Operand: i8 immediate.
    LdcI4S = 0x1F,
    /// Operand: i32 immediate.
    LdcI4 = 0x20,
    /// Operand: i64 immediate.
    LdcI8 = 0x21,
    /// Operand: f32 immediate.
    LdcR4 = 0x22,
    /// Operand: f64 immediate.
    LdcR8 = 0x23,

    // ===== Stack ops and calls (0x25-0x2A) =====
    Dup = 0x25,
    Pop = 0x26,
    /// Operand: u32 method token. Tail-dispatches with the current args.
    Jmp = 0x27,
    /// Operand: u32 method token.
    Call = 0x28,
    /// Operand: u32 signature token.
    Calli = 0x29,
    Ret = 0x2A,

    // ===== Branches, short forms (0x2B-0x37), operand i8 =====
    BrS = 0x2B,
    BrFalseS = 0x2C,
    BrTrueS = 0x2D,
    BeqS = 0x2E,
    BgeS = 0x2F,
    BgtS = 0x30,
    BleS = 0x31,
    BltS = 0x32,
    BneUnS = 0x33,
    BgeUnS = 0x34,
    BgtUnS = 0x35,
    BleUnS = 0x36,
    BltUnS = 0x37,

    // ===== Branches, long forms (0x38-0x44), operand i32 =====
    Br = 0x38,
    BrFalse = 0x39,
    BrTrue = 0x3A,
    Beq = 0x3B,
    Bge = 0x3C,
    Bgt = 0x3D,
    Ble = 0x3E,
    Blt = 0x3F,
    BneUn = 0x40,
    BgeUn = 0x41,
    BgtUn = 0x42,
    BleUn = 0x43,
    BltUn = 0x44,

    /// Operand: u32 count, then `count` i32 relative targets.
    Switch = 0x45,

    // ===== Indirect loads/stores (0x46-0x57) =====
    LdIndI1 = 0x46,
    LdIndU1 = 0x47,
    LdIndI2 = 0x48,
    LdIndU2 = 0x49,
    LdIndI4 = 0x4A,
    LdIndU4 = 0x4B,
    LdIndI8 = 0x4C,
    LdIndI = 0x4D,
    LdIndR4 = 0x4E,
    LdIndR8 = 0x4F,
    LdIndRef = 0x50,
    StIndRef = 0x51,
    StIndI1 = 0x52,
    StIndI2 = 0x53,
    StIndI4 = 0x54,
    StIndI8 = 0x55,
    StIndR4 = 0x56,
    StIndR8 = 0x57,

    // ===== Arithmetic (0x58-0x66) =====
    Add = 0x58,
    Sub = 0x59,
    Mul = 0x5A,
    Div = 0x5B,
    DivUn = 0x5C,
    Rem = 0x5D,
    RemUn = 0x5E,
    And = 0x5F,
    Or = 0x60,
    Xor = 0x61,
    Shl = 0x62,
    Shr = 0x63,
    ShrUn = 0x64,
    Neg = 0x65,
    Not = 0x66,

    // ===== Conversions (0x67-0x6E) =====
    ConvI1 = 0x67,
    ConvI2 = 0x68,
    ConvI4 = 0x69,
    ConvI8 = 0x6A,
    ConvR4 = 0x6B,
    ConvR8 = 0x6C,
    ConvU4 = 0x6D,
    ConvU8 = 0x6E,

    // ===== Object model (0x6F-0xA5) =====
    /// Operand: u32 method token.
    CallVirt = 0x6F,
    /// Operand: u32 type token.
    CpObj = 0x70,
    /// Operand: u32 type token.
    LdObj = 0x71,
    /// Operand: u32 string token.
    LdStr = 0x72,
    /// Operand: u32 constructor token.
    NewObj = 0x73,
    /// Operand: u32 type token.
    CastClass = 0x74,
    /// Operand: u32 type token.
    IsInst = 0x75,
    ConvRUn = 0x76,
    /// Operand: u32 type token.
    Unbox = 0x79,
    Throw = 0x7A,
    /// Operand: u32 field token.
    LdFld = 0x7B,
    /// Operand: u32 field token.
    LdFlda = 0x7C,
    /// Operand: u32 field token.
    StFld = 0x7D,
    /// Operand: u32 field token.
    LdsFld = 0x7E,
    /// Operand: u32 field token.
    LdsFlda = 0x7F,
    /// Operand: u32 field token.
    StsFld = 0x80,
    /// Operand: u32 type token.
    StObj = 0x81,
    ConvOvfI1Un = 0x82,
    ConvOvfI2Un = 0x83,
    ConvOvfI4Un = 0x84,
    ConvOvfI8Un = 0x85,
    ConvOvfU1Un = 0x86,
    ConvOvfU2Un = 0x87,
    ConvOvfU4Un = 0x88,
    ConvOvfU8Un = 0x89,
    ConvOvfIUn = 0x8A,
    ConvOvfUUn = 0x8B,
    /// Operand: u32 type token.
    Box = 0x8C,
    /// Operand: u32 element-type token.
    NewArr = 0x8D,
    LdLen = 0x8E,
    /// Operand: u32 element-type token.
    LdElema = 0x8F,
    LdElemI1 = 0x90,
    LdElemU1 = 0x91,
    LdElemI2 = 0x92,
    LdElemU2 = 0x93,
    LdElemI4 = 0x94,
    LdElemU4 = 0x95,
    LdElemI8 = 0x96,
    LdElemI = 0x97,
    LdElemR4 = 0x98,
    LdElemR8 = 0x99,
    LdElemRef = 0x9A,
    StElemI = 0x9B,
    StElemI1 = 0x9C,
    StElemI2 = 0x9D,
    StElemI4 = 0x9E,
    StElemI8 = 0x9F,
    StElemR4 = 0xA0,
    StElemR8 = 0xA1,
    StElemRef = 0xA2,
    /// Operand: u32 element-type token.
    LdElem = 0xA3,
    /// Operand: u32 element-type token.
    StElem = 0xA4,
    /// Operand: u32 type token.
    UnboxAny = 0xA5,

    // ===== Overflow conversions (0xB3-0xBA) =====
    ConvOvfI1 = 0xB3,
    ConvOvfU1 = 0xB4,
    ConvOvfI2 = 0xB5,
    ConvOvfU2 = 0xB6,
    ConvOvfI4 = 0xB7,
    ConvOvfU4 = 0xB8,
    ConvOvfI8 = 0xB9,
    ConvOvfU8 = 0xBA,

    // ===== Typed references, tokens (0xC2-0xD5) =====
    /// Operand: u32 type token.
    RefAnyVal = 0xC2,
    CkFinite = 0xC3,
    /// Operand: u32 type token.
    MkRefAny = 0xC6,
    /// Operand: u32 token.
    LdToken = 0xD0,
    ConvU2 = 0xD1,
    ConvU1 = 0xD2,
    ConvI = 0xD3,
    ConvOvfI = 0xD4,
    ConvOvfU = 0xD5,

    // ===== Overflow arithmetic and EH exits (0xD6-0xE0) =====
    AddOvf = 0xD6,
    AddOvfUn = 0xD7,
    MulOvf = 0xD8,
    MulOvfUn = 0xD9,
    SubOvf = 0xDA,
    SubOvfUn = 0xDB,
    EndFinally = 0xDC,
    /// Operand: i32 target.
    Leave = 0xDD,
    /// Operand: i8 target.
    LeaveS = 0xDE,
    StIndI = 0xDF,
    ConvU = 0xE0,
}

/// Extended (`0xFE`-prefixed) opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ExtOpcode {
    ArgList = 0x00,
    Ceq = 0x01,
    Cgt = 0x02,
    CgtUn = 0x03,
    Clt = 0x04,
    CltUn = 0x05,
    /// Operand: u32 method token.
    LdFtn = 0x06,
    /// Operand: u32 method token.
    LdVirtFtn = 0x07,
    /// Operand: u16 argument index.
    LdArg = 0x09,
    /// Operand: u16 argument index.
    LdArga = 0x0A,
    /// Operand: u16 argument index.
    StArg = 0x0B,
    /// Operand: u16 local index.
    LdLoc = 0x0C,
    /// Operand: u16 local index.
    LdLoca = 0x0D,
    /// Operand: u16 local index.
    StLoc = 0x0E,
    LocAlloc = 0x0F,
    EndFilter = 0x11,
    /// Operand: u8 alignment. Decode-only prefix; carries no codegen.
    Unaligned = 0x12,
    /// Decode-only prefix; carries no codegen.
    Volatile = 0x13,
    /// Decode-only prefix; carries no codegen.
    Tail = 0x14,
    /// Operand: u32 type token.
    InitObj = 0x15,
    /// Operand: u32 type token. Decode-only prefix.
    Constrained = 0x16,
    CpBlk = 0x17,
    InitBlk = 0x18,
    Rethrow = 0x1A,
    /// Operand: u32 type token.
    SizeOf = 0x1C,
    RefAnyType = 0x1D,
    /// Decode-only prefix; carries no codegen.
    Readonly = 0x1E,
}

impl Opcode {
    /// Decode a one-byte opcode. `0xFE` must be escaped through
    /// [`ExtOpcode::decode`] by the caller.
    pub fn from_byte(b: u8, offset: usize) -> Result<Self, IlError> {
        // The table is dense enough that a match on the raw value stays
        // readable and lets rustc build the jump table.
        if matches!(b, 0x24 | 0x77 | 0x78 | 0xA6..=0xB2 | 0xBB..=0xC1 | 0xC4 | 0xC5 | 0xC7..=0xCF | 0xE1..=0xFD | 0xFF)
        {
            return Err(IlError::UnknownOpcode(b, offset));
        }
        if b == EXT_PREFIX {
            return Err(IlError::UnknownOpcode(b, offset));
        }
        // Safety: every remaining byte value is a declared discriminant.
        Ok(unsafe { core::mem::transmute::<u8, Opcode>(b) })
    }
}

impl ExtOpcode {
    /// Decode the byte following an `0xFE` prefix.
    pub fn from_byte(b: u8, offset: usize) -> Result<Self, IlError> {
        if matches!(b, 0x08 | 0x10 | 0x19 | 0x1B) || b > 0x1E {
            return Err(IlError::UnknownExtOpcode(b, offset));
        }
        // Safety: every remaining byte value is a declared discriminant.
        Ok(unsafe { core::mem::transmute::<u8, ExtOpcode>(b) })
    }

    /// Decode an extended opcode from a cursor positioned after the prefix.
    pub fn decode(cursor: &mut IlCursor<'_>) -> Result<Self, IlError> {
        let at = cursor.offset();
        let b = cursor.read_u8()?;
        Self::from_byte(b, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_page_roundtrip() {
        assert_eq!(Opcode::from_byte(0x00, 0).unwrap(), Opcode::Nop);
        assert_eq!(Opcode::from_byte(0x2A, 0).unwrap(), Opcode::Ret);
        assert_eq!(Opcode::from_byte(0x58, 0).unwrap(), Opcode::Add);
        assert_eq!(Opcode::from_byte(0x6F, 0).unwrap(), Opcode::CallVirt);
        assert_eq!(Opcode::from_byte(0x8D, 0).unwrap(), Opcode::NewArr);
        assert_eq!(Opcode::from_byte(0xDD, 0).unwrap(), Opcode::Leave);
        assert_eq!(Opcode::from_byte(0xE0, 0).unwrap(), Opcode::ConvU);
    }

    #[test]
    fn test_holes_rejected() {
        for b in [0x24u8, 0x77, 0xA6, 0xB0, 0xC0, 0xC7, 0xE1, 0xFE, 0xFF] {
            assert!(Opcode::from_byte(b, 5).is_err(), "{b:#04x} accepted");
        }
    }

    #[test]
    fn test_extended_page() {
        assert_eq!(ExtOpcode::from_byte(0x01, 0).unwrap(), ExtOpcode::Ceq);
        assert_eq!(ExtOpcode::from_byte(0x0F, 0).unwrap(), ExtOpcode::LocAlloc);
        assert_eq!(ExtOpcode::from_byte(0x1A, 0).unwrap(), ExtOpcode::Rethrow);
        assert_eq!(
            ExtOpcode::from_byte(0x08, 3),
            Err(IlError::UnknownExtOpcode(0x08, 3))
        );
        assert_eq!(
            ExtOpcode::from_byte(0x40, 3),
            Err(IlError::UnknownExtOpcode(0x40, 3))
        );
    }

    #[test]
    fn test_every_declared_discriminant_decodes() {
        let mut accepted = 0;
        for b in 0u8..=0xFF {
            if Opcode::from_byte(b, 0).is_ok() {
                accepted += 1;
            }
        }
        // The population is pinned so an edit to the enum shows up here:
        // 36 + 82 + 45 + 8 + 2 + 1 + 17 declared discriminants.
        assert_eq!(accepted, 191);
    }
}
