//! Blocks, block groups and their descriptors.
//!
//! The heap is carved out of megablock-aligned reservations. Each
//! megablock starts with a table of 64-byte block descriptors, one slot
//! per block, followed by the payload blocks themselves. Because the
//! layout is pure address arithmetic, [`bdescr`] maps any heap pointer to
//! its descriptor with shifts and masks and no memory traffic beyond the
//! descriptor itself.

use crate::storage::Step;
use crate::Word;

pub const BLOCK_SHIFT: usize = 12;
/// Fixed unit of heap memory.
pub const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;
pub const BLOCK_SIZE_W: usize = BLOCK_SIZE / core::mem::size_of::<Word>();
pub const BLOCK_MASK: usize = BLOCK_SIZE - 1;

pub const MBLOCK_SHIFT: usize = 20;
pub const MBLOCK_SIZE: usize = 1 << MBLOCK_SHIFT;
pub const MBLOCK_MASK: usize = MBLOCK_SIZE - 1;

pub const BDESCR_SHIFT: usize = 6;
pub const BDESCR_SIZE: usize = 1 << BDESCR_SHIFT;

/// Byte offset of the first payload block in a megablock; everything
/// below it is the descriptor table.
pub const FIRST_BLOCK_OFF: usize = MBLOCK_SIZE >> (BLOCK_SHIFT - BDESCR_SHIFT);
pub const BLOCKS_PER_MBLOCK: usize = (MBLOCK_SIZE - FIRST_BLOCK_OFF) / BLOCK_SIZE;

/// Objects at or above this byte size take the large-object allocation
/// path and are managed by whole-block promotion instead of copying.
pub const LARGE_OBJECT_THRESHOLD: usize = BLOCK_SIZE * 8 / 10;

/// Number of blocks spanned by a group of `n` contiguous megablocks: all
/// of the first megablock's payload plus the later megablocks whole
/// (their descriptor slots are never used).
pub const fn mblock_group_blocks(n_mblocks: usize) -> usize {
    BLOCKS_PER_MBLOCK + (n_mblocks - 1) * (MBLOCK_SIZE / BLOCK_SIZE)
}

pub const fn block_round_up(bytes: usize) -> usize {
    (bytes + BLOCK_SIZE - 1) & !BLOCK_MASK
}

/// Block-group flags.
pub const BF_LARGE: u16 = 1 << 1;
pub const BF_EVACUATED: u16 = 1 << 2;
pub const BF_PINNED: u16 = 1 << 4;
/// On the block allocator's free list.
pub const BF_FREE: u16 = 1 << 5;
pub const BF_EXEC: u16 = 1 << 6;

/// Descriptor of one block group. Lives in the owning megablock's
/// descriptor table and is found from any pointer into the group with
/// [`bdescr`]; only the head block's descriptor is meaningful for a
/// multi-block group.
#[repr(C)]
pub struct BlockDescr {
    /// First word of the block payload.
    pub start: *mut Word,
    /// Bump pointer; first free word in the block group.
    pub free: *mut Word,
    /// Forward pointer when the group is chained on a block list.
    pub link: *mut BlockDescr,
    /// Back pointer of doubly-linked block lists.
    pub back: *mut BlockDescr,
    /// Owning step, when the group belongs to the generational layout.
    pub step: *mut Step,
    /// Generation number of the owning step. The executable-memory
    /// allocator repurposes this field as the page's live word count.
    pub gen_no: u32,
    /// Number of contiguous blocks in this group.
    pub blocks: u32,
    pub flags: u16,
    _pad: [u8; 14],
}

// The address arithmetic in `bdescr` bakes in the descriptor size.
const _BDESCR_SIZE_CHECK: [(); BDESCR_SIZE] = [(); core::mem::size_of::<BlockDescr>()];

/// Map a heap pointer to the descriptor of the block containing it.
///
/// # Safety
/// `p` must point into a block handed out by the block allocator;
/// anything else yields a dangling descriptor pointer.
#[inline(always)]
pub unsafe fn bdescr(p: *const Word) -> *mut BlockDescr {
    let addr = p as usize;
    (((addr & MBLOCK_MASK & !BLOCK_MASK) >> (BLOCK_SHIFT - BDESCR_SHIFT)) | (addr & !MBLOCK_MASK))
        as *mut BlockDescr
}

impl BlockDescr {
    /// Wire a freshly allocated group into `stp`. Flags and `free` are the
    /// caller's business.
    ///
    /// # Safety
    /// `stp` must outlive the group's membership of that step.
    #[inline]
    pub unsafe fn init_into(&mut self, stp: *mut Step) {
        self.step = stp;
        self.gen_no = (*stp).gen_no as u32;
    }

    #[inline]
    pub fn end(&self) -> *mut Word {
        unsafe { self.start.add(self.blocks as usize * BLOCK_SIZE_W) }
    }

    #[inline]
    pub fn free_words(&self) -> usize {
        (self.end() as usize - self.free as usize) / core::mem::size_of::<Word>()
    }
}

/// Prepend `bd` onto the doubly-linked list rooted at `list`.
///
/// # Safety
/// `bd` must not already be on a list sharing descriptors with `list`.
pub unsafe fn dbl_link_onto(bd: *mut BlockDescr, list: &mut *mut BlockDescr) {
    (*bd).link = *list;
    (*bd).back = core::ptr::null_mut();
    if !(*list).is_null() {
        (**list).back = bd;
    }
    *list = bd;
}

/// Unlink `bd` from the doubly-linked list rooted at `list`.
///
/// # Safety
/// `bd` must currently be on the list rooted at `list`.
pub unsafe fn dbl_link_remove(bd: *mut BlockDescr, list: &mut *mut BlockDescr) {
    if !(*bd).back.is_null() {
        (*(*bd).back).link = (*bd).link;
    } else {
        debug_assert_eq!(*list, bd);
        *list = (*bd).link;
    }
    if !(*bd).link.is_null() {
        (*(*bd).link).back = (*bd).back;
    }
}

/// Total blocks on a chain, following `link`. Groups count with their
/// full width, so the result is comparable against the `n_*` counters.
pub fn count_blocks(mut bd: *const BlockDescr) -> usize {
    let mut n = 0;
    unsafe {
        while !bd.is_null() {
            n += (*bd).blocks as usize;
            bd = (*bd).link;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants() {
        assert_eq!(core::mem::size_of::<BlockDescr>(), BDESCR_SIZE);
        assert_eq!(FIRST_BLOCK_OFF % BLOCK_SIZE, 0);
        // one descriptor slot per block slot in the megablock
        assert_eq!(FIRST_BLOCK_OFF, (MBLOCK_SIZE / BLOCK_SIZE) * BDESCR_SIZE);
        assert!(LARGE_OBJECT_THRESHOLD < BLOCK_SIZE);
    }

    #[test]
    fn round_up_is_block_multiple() {
        assert_eq!(block_round_up(1), BLOCK_SIZE);
        assert_eq!(block_round_up(BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(block_round_up(BLOCK_SIZE + 1), 2 * BLOCK_SIZE);
    }
}
