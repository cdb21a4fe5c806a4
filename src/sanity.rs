//! Heap sanity checks. Cheap enough to run on every nursery refill in
//! debug builds; a failure means the storage invariants are already
//! broken, so they fault loudly.

use crate::block::{count_blocks, BlockDescr, BLOCK_SIZE_W};
use crate::storage::Step;
use std::ptr::null_mut;

/// A block's bump pointer must stay inside the group.
pub unsafe fn check_block(bd: *const BlockDescr) {
    if ((*bd).free as usize) < ((*bd).start as usize)
        || (*bd).free > (*bd).start.add((*bd).blocks as usize * BLOCK_SIZE_W)
    {
        barf!(
            "check_block: free pointer {:p} outside [{:p}, +{} blocks]",
            (*bd).free,
            (*bd).start,
            (*bd).blocks
        );
    }
}

/// Walk a nursery's doubly-linked chain: back pointers must mirror the
/// forward links, every block must belong to the nursery's step, and the
/// chain must add up to the recorded block count.
pub fn check_nursery_sanity(stp: *mut Step) {
    unsafe {
        let mut blocks = 0;
        let mut prev: *mut BlockDescr = null_mut();
        let mut bd = (*stp).blocks;
        while !bd.is_null() {
            if (*bd).back != prev {
                barf!("check_nursery_sanity: bad back pointer on {:p}", bd);
            }
            if (*bd).step != stp {
                barf!("check_nursery_sanity: block {:p} on the wrong step", bd);
            }
            check_block(bd);
            blocks += (*bd).blocks as usize;
            prev = bd;
            bd = (*bd).link;
        }
        if blocks != (*stp).n_blocks {
            barf!(
                "check_nursery_sanity: counted {} blocks, step says {}",
                blocks,
                (*stp).n_blocks
            );
        }
    }
}

/// Chain/counter agreement for a step's large-object list.
pub fn check_large_objects(stp: *mut Step) {
    unsafe {
        if count_blocks((*stp).large_objects) != (*stp).n_large_blocks {
            barf!(
                "check_large_objects: chain and n_large_blocks disagree on step {}",
                (*stp).abs_no
            );
        }
    }
}
