//! Token tables: types, fields, statics, call signatures
//!
//! Tokens are 32-bit keys. Type tokens resolve through a registry; field
//! tokens carry their layout inline (offset, size, signedness) so `ldfld`
//! needs no lookup at all; static-field tokens resolve to a registered
//! address (an unregistered token is interpreted as a raw address, the
//! original image-relative shortcut). `calli` signature tokens pack
//! `(return_kind << 8) | arg_count`.

use crate::types::MethodTablePtr;
use dashmap::DashMap;
use vela_il::ReturnKind;

/// Type-token registry: token → MethodTable.
pub struct TypeTokenTable {
    map: DashMap<u32, MethodTablePtr>,
}

impl TypeTokenTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Bind a token to a type. Rebinding overwrites quietly.
    pub fn register(&self, token: u32, mt: MethodTablePtr) {
        self.map.insert(token, mt);
    }

    /// Resolve a token.
    pub fn resolve(&self, token: u32) -> Option<MethodTablePtr> {
        self.map.get(&token).map(|e| *e)
    }
}

impl Default for TypeTokenTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered static field.
#[derive(Debug, Clone, Copy)]
pub struct StaticField {
    /// Address of the storage.
    pub addr: u64,
    /// Field size in bytes (1, 2, 4, 8).
    pub size: u8,
    /// Sign-extend on load.
    pub signed: bool,
    /// The field holds a GC reference (storage must be a registered root).
    pub is_ref: bool,
}

/// Static-field registry: token → storage descriptor.
pub struct StaticFieldTable {
    map: DashMap<u32, StaticField>,
}

impl StaticFieldTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Bind a token to a static field.
    pub fn register(&self, token: u32, field: StaticField) {
        self.map.insert(token, field);
    }

    /// Resolve a token. Unregistered tokens fall back to treating the token
    /// value as the raw address of an 8-byte slot.
    pub fn resolve(&self, token: u32) -> StaticField {
        self.map.get(&token).map(|e| *e).unwrap_or(StaticField {
            addr: token as u64,
            size: 8,
            signed: false,
            is_ref: false,
        })
    }
}

impl Default for StaticFieldTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Layout carried by an instance-field token:
/// bits 0..16 byte offset, bits 16..20 size (1/2/4/8), bit 20 signed,
/// bit 21 the field is a GC reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDesc {
    /// Byte offset from the object base (after the MT word for classes).
    pub offset: u16,
    /// Field size in bytes (1, 2, 4, 8).
    pub size: u8,
    /// Sign-extend on load.
    pub signed: bool,
    /// The field holds a GC reference.
    pub is_ref: bool,
}

impl FieldDesc {
    /// Encode into a field token.
    pub fn encode(self) -> u32 {
        debug_assert!(matches!(self.size, 1 | 2 | 4 | 8));
        (self.offset as u32)
            | ((self.size as u32) << 16)
            | ((self.signed as u32) << 20)
            | ((self.is_ref as u32) << 21)
    }

    /// Decode from a field token.
    pub fn decode(token: u32) -> Self {
        Self {
            offset: (token & 0xFFFF) as u16,
            size: ((token >> 16) & 0xF) as u8,
            signed: token & (1 << 20) != 0,
            is_ref: token & (1 << 21) != 0,
        }
    }
}

/// Pack a `calli` signature token.
pub fn calli_sig(return_kind: ReturnKind, arg_count: u8) -> u32 {
    ((return_kind.to_sig_byte() as u32) << 8) | arg_count as u32
}

/// Unpack a `calli` signature token.
pub fn decode_calli_sig(token: u32) -> (ReturnKind, u8) {
    (
        ReturnKind::from_sig_byte(((token >> 8) & 0xFF) as u8),
        (token & 0xFF) as u8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MethodTableBuilder;

    #[test]
    fn test_type_tokens() {
        let t = TypeTokenTable::new();
        let mt = MethodTableBuilder::class(16).build();
        assert!(t.resolve(0x0200_0001).is_none());
        t.register(0x0200_0001, mt);
        assert_eq!(t.resolve(0x0200_0001), Some(mt));
    }

    #[test]
    fn test_field_desc_roundtrip() {
        for desc in [
            FieldDesc {
                offset: 8,
                size: 4,
                signed: true,
                is_ref: false,
            },
            FieldDesc {
                offset: 0x1F0,
                size: 8,
                signed: false,
                is_ref: true,
            },
            FieldDesc {
                offset: 1,
                size: 1,
                signed: false,
                is_ref: false,
            },
        ] {
            assert_eq!(FieldDesc::decode(desc.encode()), desc);
        }
    }

    #[test]
    fn test_static_fallback_is_raw_address() {
        let t = StaticFieldTable::new();
        let f = t.resolve(0x1234);
        assert_eq!(f.addr, 0x1234);
        assert_eq!(f.size, 8);

        let slot = Box::leak(Box::new(0u64));
        t.register(
            0x0400_0001,
            StaticField {
                addr: slot as *mut u64 as u64,
                size: 4,
                signed: true,
                is_ref: false,
            },
        );
        assert_eq!(t.resolve(0x0400_0001).size, 4);
    }

    #[test]
    fn test_calli_sig_roundtrip() {
        let tok = calli_sig(ReturnKind::I64, 3);
        assert_eq!(decode_calli_sig(tok), (ReturnKind::I64, 3));
        let tok = calli_sig(ReturnKind::Void, 0);
        assert_eq!(decode_calli_sig(tok), (ReturnKind::Void, 0));
    }
}
