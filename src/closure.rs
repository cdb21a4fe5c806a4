//! Minimal closure model.
//!
//! The storage manager does not interpret closure payloads; it only needs
//! info-pointer identity (for the clean/dirty write-barrier transitions
//! and CAF reversion) and a handful of header-adjacent fields. Generated
//! code shares this layout, so everything here is `#[repr(C)]`.

use crate::Word;
use std::ptr::NonNull;

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClosureType {
    Invalid = 0,
    IndStatic,
    MutVarClean,
    MutVarDirty,
    MvarClean,
    MvarDirty,
    BlackHole,
    Tso,
    Thunk,
}

#[repr(C)]
pub struct InfoTable {
    pub ty: ClosureType,
}

pub static IND_STATIC_INFO: InfoTable = InfoTable {
    ty: ClosureType::IndStatic,
};
pub static MUT_VAR_CLEAN_INFO: InfoTable = InfoTable {
    ty: ClosureType::MutVarClean,
};
pub static MUT_VAR_DIRTY_INFO: InfoTable = InfoTable {
    ty: ClosureType::MutVarDirty,
};
pub static MVAR_CLEAN_INFO: InfoTable = InfoTable {
    ty: ClosureType::MvarClean,
};
pub static MVAR_DIRTY_INFO: InfoTable = InfoTable {
    ty: ClosureType::MvarDirty,
};
pub static BLACKHOLE_INFO: InfoTable = InfoTable {
    ty: ClosureType::BlackHole,
};
pub static TSO_INFO: InfoTable = InfoTable {
    ty: ClosureType::Tso,
};
pub static THUNK_INFO: InfoTable = InfoTable {
    ty: ClosureType::Thunk,
};

/// Common closure header: one info pointer.
#[repr(C)]
pub struct Closure {
    pub info: *const InfoTable,
}

/// Static indirection, the shape every CAF takes once entered. The
/// `static_link` field doubles as the CAF-list link while the closure sits
/// on one of the registries.
#[repr(C)]
pub struct IndStatic {
    pub header: Closure,
    pub indirectee: *mut Closure,
    pub static_link: *mut Closure,
    /// Original info pointer, kept so an interactive session can revert
    /// the CAF to its unevaluated form. Null means "not revertible".
    pub saved_info: *const InfoTable,
}

/// Single-cell mutable reference.
#[repr(C)]
pub struct MutVar {
    pub header: Closure,
    pub var: *mut Closure,
}

/// Synchronizing mutable box.
#[repr(C)]
pub struct MVar {
    pub header: Closure,
    pub head: *mut Tso,
    pub tail: *mut Tso,
    pub value: *mut Closure,
}

pub const TSO_LINK_DIRTY: u32 = 1 << 0;

/// Thread state object. Only the fields the storage manager touches.
#[repr(C)]
pub struct Tso {
    pub header: Closure,
    pub link: *mut Tso,
    pub sp: *mut Word,
    pub dirty: u32,
    pub flags: u32,
}

/// End-of-queue sentinel for TSO links. Never dereferenced; compared by
/// identity only.
#[inline(always)]
pub fn end_tso_queue() -> *mut Tso {
    NonNull::dangling().as_ptr()
}

/// Cheap shape check on an info pointer: non-null and word-aligned.
#[inline]
pub fn looks_like_info_ptr(p: *const InfoTable) -> bool {
    !p.is_null() && (p as usize) % core::mem::align_of::<Word>() == 0
}

/// Cheap shape check on a closure pointer: the header must hold something
/// that could be an info pointer.
#[inline]
pub fn looks_like_closure_ptr(c: *const Closure) -> bool {
    if c.is_null() || (c as usize) % core::mem::align_of::<Word>() != 0 {
        return false;
    }
    unsafe { looks_like_info_ptr((*c).info) }
}

impl IndStatic {
    /// A CAF in its pre-entry state, for tests and the interactive loader.
    pub fn new_caf_closure() -> Self {
        Self {
            header: Closure {
                info: &THUNK_INFO,
            },
            indirectee: core::ptr::null_mut(),
            static_link: core::ptr::null_mut(),
            saved_info: core::ptr::null(),
        }
    }
}

impl Tso {
    pub fn new() -> Self {
        Self {
            header: Closure { info: &TSO_INFO },
            link: end_tso_queue(),
            sp: core::ptr::null_mut(),
            dirty: 0,
            flags: 0,
        }
    }
}

impl Default for Tso {
    fn default() -> Self {
        Self::new()
    }
}
