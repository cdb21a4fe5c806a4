//! Mutator write barriers and remembered-set recording.
//!
//! Every barrier has the same shape: detect a clean-to-dirty transition
//! on the object, and if the object lives outside the nursery
//! (`gen_no > 0`), record it on the writing capability's mutable list for
//! that generation so the next young collection scans it as a root.

use crate::block::{bdescr, BlockDescr, BLOCK_SIZE};
use crate::capability::Capability;
use crate::closure::*;
use crate::storage::StorageManager;
use crate::Word;

/// Fast-path predicate for the mutable-variable barrier; generated code
/// inlines this and only calls [`StorageManager::dirty_mut_var`] when it
/// holds.
#[inline(always)]
pub fn mut_var_is_clean(p: *const Closure) -> bool {
    unsafe { (*p).info == &MUT_VAR_CLEAN_INFO as *const InfoTable }
}

/// Fast-path predicate for the MVar barrier, inlined at call sites the
/// same way.
#[inline(always)]
pub fn mvar_is_clean(p: *const Closure) -> bool {
    unsafe { (*p).info == &MVAR_CLEAN_INFO as *const InfoTable }
}

/// A TSO has moved: keep its stack pointer valid relative to the new
/// address.
///
/// # Safety
/// `dest` must be a fully copied image of the TSO at `src`.
pub unsafe fn move_tso(src: *mut Tso, dest: *mut Tso) {
    // relocate the stack pointer, in words
    let diff = (dest as isize - src as isize) / core::mem::size_of::<Word>() as isize;
    (*dest).sp = ((*dest).sp as isize + diff * core::mem::size_of::<Word>() as isize) as *mut Word;
}

impl StorageManager {
    /// Append `p` to generation `gen_no`'s own mutable list.
    ///
    /// Callers either hold the SM lock (CAF registration) or run inside
    /// the stopped-world collector.
    pub fn record_mutable_gen(&mut self, p: *mut Closure, gen_no: usize) {
        unsafe {
            let gen = self.generation_ptr(gen_no);
            let mut bd = (*gen).mut_list;
            if ((*bd).free as usize) >= ((*bd).start as usize) + BLOCK_SIZE {
                let new_bd = self.block_alloc.alloc_block();
                (*new_bd).link = bd;
                bd = new_bd;
                (*gen).mut_list = bd;
            }
            Self::push_mutable(bd, p);
        }
    }

    /// Append `p` to `cap`'s mutable list for `gen_no`. Lock-free except
    /// when the tail block fills up and a fresh one is taken under the SM
    /// lock.
    pub fn record_mutable_cap(&mut self, p: *mut Closure, cap: &mut Capability, gen_no: usize) {
        unsafe {
            let mut bd = cap.mut_lists[gen_no];
            if bd.is_null() || ((*bd).free as usize) >= ((*bd).start as usize) + BLOCK_SIZE {
                let new_bd = self.alloc_block_lock();
                (*new_bd).link = bd;
                bd = new_bd;
                cap.mut_lists[gen_no] = bd;
            }
            Self::push_mutable(bd, p);
        }
    }

    /// Write barrier for mutable variables. A clean cell is not on any
    /// mutable list; the first write after it was last scanned flips it
    /// dirty and records it.
    pub fn dirty_mut_var(&mut self, cap: &mut Capability, p: *mut Closure) {
        unsafe {
            if (*p).info == &MUT_VAR_CLEAN_INFO as *const InfoTable {
                (*p).info = &MUT_VAR_DIRTY_INFO;
                let bd = bdescr(p as *const Word);
                if (*bd).gen_no > 0 {
                    self.record_mutable_cap(p, cap, (*bd).gen_no as usize);
                }
            }
        }
    }

    /// Set a TSO's link field through the write barrier.
    ///
    /// Not needed when: the target is the end-of-queue sentinel; the TSO
    /// is being put on the blackhole queue; or the TSO is the currently
    /// running thread (it is already dirty).
    pub fn set_tso_link(&mut self, cap: &mut Capability, tso: *mut Tso, target: *mut Tso) {
        unsafe {
            if (*tso).dirty == 0 && (*tso).flags & TSO_LINK_DIRTY == 0 {
                (*tso).flags |= TSO_LINK_DIRTY;
                let bd = bdescr(tso as *const Word);
                if (*bd).gen_no > 0 {
                    self.record_mutable_cap(tso as *mut Closure, cap, (*bd).gen_no as usize);
                }
            }
            (*tso).link = target;
        }
    }

    /// Mark a whole TSO dirty (its stack is about to be mutated).
    pub fn dirty_tso(&mut self, cap: &mut Capability, tso: *mut Tso) {
        unsafe {
            if (*tso).dirty == 0 && (*tso).flags & TSO_LINK_DIRTY == 0 {
                let bd = bdescr(tso as *const Word);
                if (*bd).gen_no > 0 {
                    self.record_mutable_cap(tso as *mut Closure, cap, (*bd).gen_no as usize);
                }
            }
            (*tso).dirty = 1;
        }
    }

    /// Write barrier for MVars. The clean check is inlined at the call
    /// site ([`mvar_is_clean`]); by the time we get here the MVar is
    /// known to need recording.
    pub fn dirty_mvar(&mut self, cap: &mut Capability, p: *mut Closure) {
        unsafe {
            let bd = bdescr(p as *const Word);
            if (*bd).gen_no > 0 {
                self.record_mutable_cap(p, cap, (*bd).gen_no as usize);
            }
        }
    }

    #[inline]
    unsafe fn push_mutable(bd: *mut BlockDescr, p: *mut Closure) {
        *(*bd).free = p as Word;
        (*bd).free = (*bd).free.add(1);
    }
}
