//! CAF registry.
//!
//! The entry code of every top-level thunk calls [`new_caf`](StorageManager::new_caf)
//! the first time the thunk is evaluated, after overwriting it with a
//! static indirection to the heap-allocated black hole. A statically
//! compiled CAF only needs to become a collector root from then on; a CAF
//! loaded into an interactive session must additionally be retained
//! forever and be revertible to its unevaluated form, so those go onto a
//! separate list together with their original info pointer.

use crate::closure::{Closure, IndStatic};
use crate::storage::StorageManager;
use parking_lot::lock_api::RawMutex;
use std::ptr::null_mut;

impl StorageManager {
    /// Retain every CAF from here on (set by the in-process linker before
    /// it hands out code that may share CAFs with the host program).
    pub fn set_keep_cafs(&mut self) {
        self.keep_cafs = true;
    }

    /// Register a CAF from statically compiled code.
    pub fn new_caf(&mut self, caf: *mut IndStatic) {
        self.sm_lock.lock();
        unsafe {
            if cfg!(feature = "dynamic") && self.keep_cafs {
                // Dynamic libraries may be shared between the interpreted
                // program and the host session, so their CAFs must never
                // be reverted nor collected: keep them on caf_list
                // forever.
                (*caf).saved_info = (*caf).header.info;
                (*caf).static_link = self.caf_list;
                self.caf_list = caf as *mut Closure;
                self.sm_lock.unlock();
                return;
            }

            // An ordinary CAF only needs to be scanned as a root when a
            // younger generation is collected: record it on the oldest
            // generation's mutable list. The static-link field stands in
            // for the mut-list link; a major collection is done with the
            // mutable list before it needs static links again.
            (*caf).saved_info = core::ptr::null();
            let oldest = (*self.oldest_gen()).no;
            self.record_mutable_gen(caf as *mut Closure, oldest);

            self.sm_lock.unlock();
        }
    }

    /// Register a CAF from code loaded into an interactive session. All
    /// of these are retained (they may be demanded by any later
    /// command-line expression) and revertible.
    pub fn new_dyn_caf(&mut self, caf: *mut IndStatic) {
        self.sm_lock.lock();
        unsafe {
            (*caf).saved_info = (*caf).header.info;
            (*caf).static_link = self.revertible_caf_list;
            self.revertible_caf_list = caf as *mut Closure;
            self.sm_lock.unlock();
        }
    }

    /// Restore every revertible CAF to its unevaluated form and forget
    /// the list. The interactive loop calls this when unloading code.
    pub fn revert_cafs(&mut self) {
        unsafe {
            let mut c = self.revertible_caf_list as *mut IndStatic;
            while !c.is_null() {
                let next = (*c).static_link as *mut IndStatic;
                (*c).header.info = (*c).saved_info;
                (*c).saved_info = core::ptr::null();
                c = next;
            }
            self.revertible_caf_list = null_mut();
        }
    }

    pub fn caf_list(&self) -> *mut Closure {
        self.caf_list
    }

    pub fn revertible_caf_list(&self) -> *mut Closure {
        self.revertible_caf_list
    }
}
