//! Executable memory.
//!
//! Code produced by the JIT and the in-process linker cannot live in the
//! ordinary heap: operating systems make pages executable only on
//! request. This is a small linear allocator with page granularity: we
//! bump-allocate chunks within an executable page, count live words per
//! page in the descriptor's `gen_no` field, and unmap a page (after
//! making it non-executable again) once every chunk on it has been
//! freed. The head page is the exception: it stays hot for the next
//! request.
//!
//! Each chunk's size is stored in the word before the returned pointer;
//! that word is how `free_exec` finds the page counter, and it is zeroed
//! on free so a double free is caught.

use crate::block::*;
use crate::mmap;
use crate::storage::StorageManager;
use crate::Word;
use parking_lot::lock_api::RawMutex;
use std::mem::size_of;
use std::ptr::null_mut;

impl StorageManager {
    /// Allocate `bytes` of executable memory. The executable address is
    /// written to `exec_ret`; the returned pointer is the writable view.
    /// With the in-house allocator the two coincide (the page is mapped
    /// writable and executable); platforms that must split the views go
    /// through the foreign-closure allocator instead of this crate.
    pub fn allocate_exec(&mut self, bytes: usize, exec_ret: &mut *mut Word) -> *mut Word {
        self.sm_lock.lock();
        unsafe {
            // round up to words, one extra for the size word
            let n = (bytes + size_of::<Word>() + 1) / size_of::<Word>();

            if n + 1 > BLOCK_SIZE_W {
                // a chunk never spans pages; a bigger request is a linker bug
                barf!("allocate_exec: can't handle large objects ({} bytes)", bytes);
            }

            if self.exec_block.is_null()
                || ((*self.exec_block).free as usize) + (n + 1) * size_of::<Word>()
                    > ((*self.exec_block).start as usize) + BLOCK_SIZE
            {
                let page_size = mmap::page_size();
                let bd = self.block_alloc.alloc_group(std::cmp::max(1, page_size / BLOCK_SIZE));
                logln_if!(
                    self.flags.debug.gc,
                    "storage: allocate exec block {:p}",
                    (*bd).start
                );
                (*bd).gen_no = 0;
                (*bd).flags = BF_EXEC;
                (*bd).link = self.exec_block;
                if !self.exec_block.is_null() {
                    (*self.exec_block).back = bd;
                }
                (*bd).back = null_mut();
                mmap::set_executable(
                    (*bd).start as *mut u8,
                    (*bd).blocks as usize * BLOCK_SIZE,
                    true,
                );
                self.exec_block = bd;
            }

            let eb = self.exec_block;
            *(*eb).free = n; // chunk size, the only in-band metadata
            (*eb).gen_no += n as u32; // gen_no counts live words on this page
            let ret = (*eb).free.add(1);
            (*eb).free = (*eb).free.add(n + 1);

            self.sm_lock.unlock();
            *exec_ret = ret;
            ret
        }
    }

    /// Free a chunk previously returned by [`allocate_exec`] (pass the
    /// executable address). When the page's live count drops to zero the
    /// page is made non-executable and returned to the block allocator,
    /// unless it is the head page, which is recycled in place.
    pub fn free_exec(&mut self, addr: *mut Word) {
        unsafe {
            let p = addr.sub(1);
            let bd = bdescr(p);

            if (*bd).flags & BF_EXEC == 0 {
                barf!("free_exec: not executable");
            }
            if *p == 0 {
                barf!("free_exec: already free?");
            }

            self.sm_lock.lock();

            (*bd).gen_no -= *p as u32;
            *p = 0;

            if (*bd).gen_no == 0 {
                // Free the page if it is empty, but not if it is the one
                // at the head of the queue.
                if bd != self.exec_block {
                    logln_if!(
                        self.flags.debug.gc,
                        "storage: free exec block {:p}",
                        (*bd).start
                    );
                    dbl_link_remove(bd, &mut self.exec_block);
                    mmap::set_executable(
                        (*bd).start as *mut u8,
                        (*bd).blocks as usize * BLOCK_SIZE,
                        false,
                    );
                    self.block_alloc.free_group(bd);
                } else {
                    (*bd).free = (*bd).start;
                }
            }

            self.sm_lock.unlock();
        }
    }

    /// Head of the exec-page list.
    pub fn exec_block(&self) -> *mut BlockDescr {
        self.exec_block
    }
}
