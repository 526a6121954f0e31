//! Method registry: token → callable entry
//!
//! The process-wide resolver for `call` / `callvirt` / `calli` / `newobj`.
//! Tokens are opaque 32-bit keys; the registry is the only component that
//! interprets them. Reads vastly outnumber writes, so the map is a
//! `DashMap` and resolution never takes an exclusive lock.

use crate::types::{MethodTablePtr, ObjectRef};
use dashmap::DashMap;
use vela_il::ReturnKind;

/// How a call site reaches the method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    /// Fixed entrypoint, no `this`.
    Static,
    /// Fixed entrypoint with a `this` argument.
    Instance,
    /// Dispatch through the receiver's vtable.
    Virtual {
        /// Vtable slot index.
        slot: u16,
    },
    /// Dispatch through the receiver's interface map.
    Interface {
        /// The interface's MethodTable.
        interface_mt: MethodTablePtr,
        /// Method index within the interface.
        method_index: u16,
    },
    /// `newobj` constructor for a type.
    Constructor {
        /// The constructed type.
        owning_mt: MethodTablePtr,
    },
}

/// One registered method.
#[derive(Debug, Clone, Copy)]
pub struct MethodEntry {
    /// Native entrypoint (for virtual/interface methods: the fallback used
    /// by `ldftn`; call sites resolve through the receiver).
    pub entrypoint: u64,
    /// Argument count including `this` when present.
    pub arg_count: u16,
    /// Return kind.
    pub return_kind: ReturnKind,
    /// Whether the first argument is `this`.
    pub has_this: bool,
    /// Dispatch discipline.
    pub dispatch: DispatchKind,
}

/// Derive the synthetic constructor token for a type. Deterministic so
/// `newobj` sites and registrations agree without a side table.
pub fn constructor_token(mt: MethodTablePtr) -> u32 {
    0x0600_0000 | (mt.hash_code() & 0x00FF_FFFF)
}

/// The process-wide method registry.
pub struct MethodRegistry {
    map: DashMap<u32, MethodEntry>,
}

impl MethodRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Register a static or instance method. Re-registering a token
    /// overwrites quietly.
    pub fn register(
        &self,
        token: u32,
        entrypoint: u64,
        arg_count: u16,
        return_kind: ReturnKind,
        has_this: bool,
    ) {
        self.map.insert(
            token,
            MethodEntry {
                entrypoint,
                arg_count,
                return_kind,
                has_this,
                dispatch: if has_this {
                    DispatchKind::Instance
                } else {
                    DispatchKind::Static
                },
            },
        );
    }

    /// Register a virtual method dispatched through vtable `slot`.
    pub fn register_virtual(
        &self,
        token: u32,
        entrypoint: u64,
        arg_count: u16,
        return_kind: ReturnKind,
        slot: u16,
    ) {
        self.map.insert(
            token,
            MethodEntry {
                entrypoint,
                arg_count,
                return_kind,
                has_this: true,
                dispatch: DispatchKind::Virtual { slot },
            },
        );
    }

    /// Register an interface method.
    pub fn register_interface(
        &self,
        token: u32,
        entrypoint: u64,
        arg_count: u16,
        return_kind: ReturnKind,
        interface_mt: MethodTablePtr,
        method_index: u16,
    ) {
        self.map.insert(
            token,
            MethodEntry {
                entrypoint,
                arg_count,
                return_kind,
                has_this: true,
                dispatch: DispatchKind::Interface {
                    interface_mt,
                    method_index,
                },
            },
        );
    }

    /// Register a constructor under its type's derived token.
    pub fn register_constructor(
        &self,
        entrypoint: u64,
        arg_count: u16,
        owning_mt: MethodTablePtr,
    ) -> u32 {
        let token = constructor_token(owning_mt);
        self.map.insert(
            token,
            MethodEntry {
                entrypoint,
                arg_count,
                return_kind: ReturnKind::Void,
                has_this: true,
                dispatch: DispatchKind::Constructor { owning_mt },
            },
        );
        token
    }

    /// Fetch a registration.
    pub fn get(&self, token: u32) -> Option<MethodEntry> {
        self.map.get(&token).map(|e| *e)
    }

    /// Resolve a token to a callable entrypoint. Virtual and interface
    /// tokens resolve through `this`; the rest return the fixed entrypoint.
    pub fn resolve(&self, token: u32, this: Option<ObjectRef>) -> Option<u64> {
        let entry = self.get(token)?;
        match entry.dispatch {
            DispatchKind::Static | DispatchKind::Instance | DispatchKind::Constructor { .. } => {
                Some(entry.entrypoint)
            }
            DispatchKind::Virtual { slot } => {
                let mt = this?.method_table()?;
                Some(mt.vtable_slot(slot))
            }
            DispatchKind::Interface {
                interface_mt,
                method_index,
            } => {
                let mt = this?.method_table()?;
                let start = mt.interface_start_slot(interface_mt)?;
                Some(mt.vtable_slot(start + method_index))
            }
        }
    }

    /// Remove a token. Removing an unbound token is a no-op.
    pub fn remove(&self, token: u32) {
        self.map.remove(&token);
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}
