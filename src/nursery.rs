//! Nursery management.
//!
//! Each capability owns one nursery: a step whose `blocks` chain is a
//! doubly-linked list of single blocks. The collector resets and resizes
//! nurseries between collections; everything here runs either during
//! initialization (SM lock held) or at a stop-the-world safe point, so
//! the block allocator is called without further locking.

use crate::block::*;
use crate::capability::Capability;
use crate::sanity;
use crate::storage::{Step, StorageManager};
use std::ptr::null_mut;

impl StorageManager {
    /// Prepend `blocks` freshly allocated single blocks onto `tail`,
    /// maintaining the back pointers. Returns the new head.
    pub(crate) unsafe fn alloc_nursery(
        &mut self,
        stp: *mut Step,
        mut tail: *mut BlockDescr,
        blocks: usize,
    ) -> *mut BlockDescr {
        for _ in 0..blocks {
            let bd = self.block_alloc.alloc_block();
            (*bd).link = tail;
            // double-link the nursery: blocks get spliced out and
            // re-inserted by the allocator
            if !tail.is_null() {
                (*tail).back = bd;
            }
            (*bd).init_into(stp);
            (*bd).flags = 0;
            (*bd).free = (*bd).start;
            tail = bd;
        }
        (*tail).back = null_mut();
        tail
    }

    pub(crate) fn alloc_nurseries(&mut self) {
        let area = self.flags.gc.min_alloc_area_size;
        for i in 0..self.n_capabilities() {
            unsafe {
                let stp = self.nursery_ptr(i);
                (*stp).blocks = self.alloc_nursery(stp, null_mut(), area);
                (*stp).n_blocks = area;
                (*stp).old_blocks = null_mut();
                (*stp).n_old_blocks = 0;
            }
        }
    }

    /// Point every capability at its nursery and clear its allocation
    /// block; the next `allocate` refill picks one up.
    pub fn assign_nurseries_to_capabilities(&mut self, caps: &mut [Capability]) {
        debug_assert_eq!(caps.len(), self.n_capabilities());
        for cap in caps.iter_mut() {
            let stp = self.nursery_ptr(cap.no);
            cap.r.nursery = stp;
            cap.r.current_nursery = unsafe { (*stp).blocks };
            cap.r.current_alloc = null_mut();
        }
    }

    /// Post-collection reset: every nursery block becomes empty again and
    /// the nursery's large objects, all dead now, go back to the block
    /// allocator.
    pub fn reset_nurseries(&mut self, caps: &mut [Capability]) {
        for i in 0..self.n_capabilities() {
            unsafe {
                let stp = self.nursery_ptr(i);
                let mut bd = (*stp).blocks;
                while !bd.is_null() {
                    (*bd).free = (*bd).start;
                    debug_assert_eq!((*bd).gen_no, 0);
                    debug_assert_eq!((*bd).step, stp);
                    if self.flags.debug.sanity {
                        core::ptr::write_bytes((*bd).start as *mut u8, 0xaa, BLOCK_SIZE);
                    }
                    bd = (*bd).link;
                }
                let large = (*stp).large_objects;
                (*stp).large_objects = null_mut();
                (*stp).n_large_blocks = 0;
                self.block_alloc.free_chain(large);
            }
        }
        for cap in caps.iter_mut() {
            cap.pinned_object_block = null_mut();
        }
        self.assign_nurseries_to_capabilities(caps);
    }

    /// Blocks across all nurseries, large objects included.
    pub fn count_nursery_blocks(&self) -> usize {
        let mut blocks = 0;
        for stp in self.nurseries() {
            blocks += stp.n_blocks + stp.n_large_blocks;
        }
        blocks
    }

    /// Grow or shrink one nursery to exactly `blocks` blocks.
    pub fn resize_nursery(&mut self, stp: *mut Step, blocks: usize) {
        unsafe {
            let mut nursery_blocks = (*stp).n_blocks;
            if nursery_blocks == blocks {
                return;
            }

            if nursery_blocks < blocks {
                logln_if!(
                    self.flags.debug.gc,
                    "storage: increasing size of nursery to {} blocks",
                    blocks
                );
                (*stp).blocks = self.alloc_nursery(stp, (*stp).blocks, blocks - nursery_blocks);
            } else {
                logln_if!(
                    self.flags.debug.gc,
                    "storage: decreasing size of nursery to {} blocks",
                    blocks
                );

                let mut bd = (*stp).blocks;
                while nursery_blocks > blocks {
                    let next_bd = (*bd).link;
                    if !next_bd.is_null() {
                        (*next_bd).back = null_mut();
                    }
                    nursery_blocks -= (*bd).blocks as usize; // might be a large block
                    self.block_alloc.free_group(bd);
                    bd = next_bd;
                }
                (*stp).blocks = bd;
                // might have gone just under by freeing a large block;
                // make up the difference
                if nursery_blocks < blocks {
                    (*stp).blocks =
                        self.alloc_nursery(stp, (*stp).blocks, blocks - nursery_blocks);
                }
            }

            (*stp).n_blocks = blocks;
            debug_assert_eq!(count_blocks((*stp).blocks), (*stp).n_blocks);
        }
    }

    /// Resize each nursery to `blocks` blocks.
    pub fn resize_nurseries_fixed(&mut self, blocks: usize) {
        for i in 0..self.n_capabilities() {
            let stp = self.nursery_ptr(i);
            self.resize_nursery(stp, blocks);
        }
    }

    /// Resize the nurseries to a total of `blocks`, split evenly; the
    /// division remainder is dropped on purpose.
    pub fn resize_nurseries(&mut self, blocks: usize) {
        self.resize_nurseries_fixed(blocks / self.n_capabilities());
    }

    /// Debug check of one nursery's chain structure.
    pub fn check_nursery(&self, stp: *mut Step) {
        sanity::check_nursery_sanity(stp);
    }
}
