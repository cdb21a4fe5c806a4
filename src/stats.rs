//! Heap accounting: the estimators the collector and the scheduler use
//! to decide when and how hard to collect.

use crate::block::{BlockDescr, BLOCK_SIZE, BLOCK_SIZE_W};
use crate::capability::Capability;
use crate::storage::StorageManager;
use crate::utils::formatted_size;
use crate::Word;
use std::mem::size_of;

const BITS_IN_WORD: usize = size_of::<Word>() * 8;

/// Words in use across a block chain, measured from each group's bump
/// pointer.
pub fn count_occupied(mut bd: *const BlockDescr) -> usize {
    let mut words = 0;
    unsafe {
        while !bd.is_null() {
            debug_assert!((*bd).free <= (*bd).end());
            words += ((*bd).free as usize - (*bd).start as usize) / size_of::<Word>();
            bd = (*bd).link;
        }
    }
    words
}

impl StorageManager {
    /// Approximate words allocated since the last call: assume every
    /// nursery block was filled, then subtract the blocks the mutators
    /// never reached and the unused tails of the blocks they are still
    /// in. The result also accumulates into `total_allocated`.
    pub fn calc_allocated(&mut self, caps: &[Capability]) -> usize {
        let mut allocated = self.count_nursery_blocks() * BLOCK_SIZE_W;

        for cap in caps {
            unsafe {
                let cn = cap.r.current_nursery;
                if !cn.is_null() {
                    let mut bd = (*cn).link;
                    while !bd.is_null() {
                        allocated -= BLOCK_SIZE_W;
                        bd = (*bd).link;
                    }
                    if ((*cn).free as usize) < (*cn).start as usize + BLOCK_SIZE {
                        allocated -= ((*cn).start as usize + BLOCK_SIZE
                            - (*cn).free as usize)
                            / size_of::<Word>();
                    }
                }
                let pinned = cap.pinned_object_block;
                if !pinned.is_null() {
                    allocated -= ((*pinned).start as usize + BLOCK_SIZE
                        - (*pinned).free as usize)
                        / size_of::<Word>();
                }
            }
        }

        self.total_allocated += allocated as u64;
        allocated
    }

    /// Approximate live data in blocks, right after a collection. The
    /// nursery region (generation 0, step 0) is skipped when there is
    /// more than one generation; its liveness is not known yet.
    pub fn calc_live_blocks(&self) -> usize {
        let mut live = 0;
        let n_gens = self.generations().len();
        for (g, gen) in self.generations().iter().enumerate() {
            for s in 0..gen.n_steps {
                if g == 0 && s == 0 && n_gens > 1 {
                    continue;
                }
                let stp = unsafe { &*gen.steps.add(s) };
                live += stp.n_large_blocks + stp.n_blocks;
            }
        }
        live
    }

    /// Word-exact live data, same exclusion as [`calc_live_blocks`].
    pub fn calc_live_words(&self) -> usize {
        let mut live = 0;
        let n_gens = self.generations().len();
        for (g, gen) in self.generations().iter().enumerate() {
            for s in 0..gen.n_steps {
                if g == 0 && s == 0 && n_gens > 1 {
                    continue;
                }
                let stp = unsafe { &*gen.steps.add(s) };
                live += stp.n_words + count_occupied(stp.large_objects);
            }
        }
        live
    }

    /// Blocks the next collection will need, assuming everything live
    /// stays live. Copied steps that will be collected need room for the
    /// copy; marked steps need their bitmap and mark-stack slack;
    /// compacted steps need nothing extra.
    pub fn calc_needed(&self) -> usize {
        let mut needed = 0;
        for (g, gen) in self.generations().iter().enumerate() {
            for s in 0..gen.n_steps {
                if g == 0 && s == 0 {
                    continue;
                }
                let stp = unsafe { &*gen.steps.add(s) };

                needed += stp.n_blocks + stp.n_large_blocks;

                let step0 = unsafe { &*gen.steps };
                let will_collect = g == 0
                    || step0.n_blocks + step0.n_large_blocks > gen.max_blocks;
                if will_collect {
                    if stp.mark {
                        needed += stp.n_blocks / BITS_IN_WORD; // bitmap
                        needed += stp.n_blocks / 100; // mark stack
                    }
                    if !stp.compact {
                        needed += stp.n_blocks; // space for the copy
                    }
                }
            }
        }
        needed
    }

    /// Describe the generation/step layout on stderr (debug builds of
    /// the runtime dump this right after init and after major
    /// collections).
    pub(crate) fn describe_gens(&self) {
        eprintln!(
            "storage: {} generation(s), {} step(s), {} block(s) allocated",
            self.generations().len(),
            self.total_steps(),
            self.block_alloc.allocated_blocks()
        );
        for gen in self.generations() {
            for s in 0..gen.n_steps {
                let stp = unsafe { &*gen.steps.add(s) };
                eprintln!(
                    "storage:   gen {:2} step {:2} (abs {:2}): {:5} blocks, {:5} large, {} live",
                    gen.no,
                    stp.no,
                    stp.abs_no,
                    stp.n_blocks,
                    stp.n_large_blocks,
                    formatted_size(stp.n_words * size_of::<Word>())
                );
            }
        }
    }
}
