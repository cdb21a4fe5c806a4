//! Block and megablock allocator.
//!
//! Hands out single blocks and contiguous block groups carved from
//! megablock-aligned OS reservations, keeping an address-ordered free
//! list with coalescing. Groups wider than one megablock's payload get a
//! dedicated contiguous megablock reservation whose first descriptor
//! table describes the whole run.
//!
//! Callers serialize access through the storage-manager lock; nothing in
//! here locks on its own.

use crate::block::*;
use crate::mmap::Mmap;
use crate::Word;
use std::ptr::null_mut;

pub struct BlockAllocator {
    /// Free block groups in ordinary megablocks, sorted by address,
    /// chained through `link`.
    free_list: *mut BlockDescr,
    /// Every reservation we own. Ordinary megablocks stay for the process
    /// lifetime; mega-group reservations are dropped when freed.
    mblocks: Vec<Mmap>,
    pub n_alloc_blocks: usize,
    pub n_free_blocks: usize,
    trace: bool,
}

unsafe impl Send for BlockAllocator {}

impl BlockAllocator {
    pub fn new(trace: bool) -> Self {
        Self {
            free_list: null_mut(),
            mblocks: Vec::new(),
            n_alloc_blocks: 0,
            n_free_blocks: 0,
            trace,
        }
    }

    /// Allocate a single block.
    pub fn alloc_block(&mut self) -> *mut BlockDescr {
        self.alloc_group(1)
    }

    /// Allocate a group of `n` contiguous blocks. The returned group may
    /// be wider than requested when it spans whole megablocks.
    pub fn alloc_group(&mut self, n: usize) -> *mut BlockDescr {
        if n == 0 {
            barf!("alloc_group: zero blocks requested");
        }
        if n > BLOCKS_PER_MBLOCK {
            return unsafe { self.alloc_mega_group(n) };
        }
        unsafe {
            if let Some(bd) = self.take_from_free_list(n) {
                self.n_alloc_blocks += n;
                self.init_group(bd);
                return bd;
            }
            // No fit: bring in a fresh megablock, put its whole payload on
            // the free list and retry.
            let head = self.alloc_mblocks(1);
            (*head).blocks = BLOCKS_PER_MBLOCK as u32;
            self.free_list_insert(head);
            self.n_free_blocks += BLOCKS_PER_MBLOCK;
            let bd = self
                .take_from_free_list(n)
                .unwrap_or_else(|| barf!("alloc_group: fresh megablock cannot satisfy {}", n));
            self.n_alloc_blocks += n;
            self.init_group(bd);
            bd
        }
    }

    /// Free a block group previously returned by [`alloc_group`].
    pub fn free_group(&mut self, bd: *mut BlockDescr) {
        unsafe {
            debug_assert!((*bd).flags & BF_FREE == 0, "free_group: already free");
            debug_assert!((*bd).blocks != 0);
            let blocks = (*bd).blocks as usize;
            (*bd).flags = BF_FREE;
            (*bd).step = null_mut();
            (*bd).gen_no = 0;
            (*bd).free = null_mut();
            self.n_alloc_blocks -= blocks;
            if blocks > BLOCKS_PER_MBLOCK {
                self.free_mega_group(bd);
                return;
            }
            self.n_free_blocks += blocks;
            self.free_list_insert(bd);
        }
    }

    /// Free every group on a chain, following `link`.
    pub fn free_chain(&mut self, mut bd: *mut BlockDescr) {
        unsafe {
            while !bd.is_null() {
                let next = (*bd).link;
                self.free_group(bd);
                bd = next;
            }
        }
    }

    /// Split `n` blocks off the front of `bd`; returns the descriptor of
    /// the remainder. Both halves keep their `start`; the remainder's
    /// other fields are the caller's to initialize.
    ///
    /// # Safety
    /// `bd` must be an allocated group of more than `n` blocks that does
    /// not span megablocks.
    pub unsafe fn split_block_group(&mut self, bd: *mut BlockDescr, n: usize) -> *mut BlockDescr {
        if n == 0 || n >= (*bd).blocks as usize {
            barf!("split_block_group: bad split {} of {}", n, (*bd).blocks);
        }
        if (*bd).blocks as usize > BLOCKS_PER_MBLOCK {
            barf!("split_block_group: can't split a megablock group");
        }
        let rest_start = (*bd).start.add(n * BLOCK_SIZE_W);
        debug_assert_eq!(
            (*bd).start as usize & !MBLOCK_MASK,
            rest_start as usize & !MBLOCK_MASK
        );
        let new_bd = bdescr(rest_start);
        debug_assert_eq!((*new_bd).start, rest_start);
        (*new_bd).blocks = (*bd).blocks - n as u32;
        (*new_bd).link = null_mut();
        (*new_bd).back = null_mut();
        (*new_bd).flags = 0;
        (*bd).blocks = n as u32;
        new_bd
    }

    /// Blocks currently handed out.
    pub fn allocated_blocks(&self) -> usize {
        self.n_alloc_blocks
    }

    /// Whether `addr` falls inside any reservation we own (the
    /// heap-allocated predicate for static/dynamic classification).
    pub fn contains(&self, addr: usize) -> bool {
        self.mblocks.iter().any(|m| {
            let lo = m.start() as usize;
            addr >= lo && addr < lo + m.size()
        })
    }

    // ---------------------------------------------------------------
    // internals

    /// First-fit over the address-ordered free list. Splits the head off
    /// an oversized group and leaves the remainder in place, preserving
    /// the ordering.
    unsafe fn take_from_free_list(&mut self, n: usize) -> Option<*mut BlockDescr> {
        let mut prev: *mut BlockDescr = null_mut();
        let mut bd = self.free_list;
        while !bd.is_null() {
            let w = (*bd).blocks as usize;
            if w >= n {
                let next = (*bd).link;
                let replacement = if w > n {
                    let rest = self.split_block_group(bd, n);
                    (*rest).flags = BF_FREE;
                    (*rest).free = null_mut();
                    (*rest).link = next;
                    rest
                } else {
                    next
                };
                if prev.is_null() {
                    self.free_list = replacement;
                } else {
                    (*prev).link = replacement;
                }
                self.n_free_blocks -= n;
                return Some(bd);
            }
            prev = bd;
            bd = (*bd).link;
        }
        None
    }

    /// Insert into the address-ordered free list, coalescing with both
    /// neighbours when they are contiguous within the same megablock.
    unsafe fn free_list_insert(&mut self, bd: *mut BlockDescr) {
        let mut prev: *mut BlockDescr = null_mut();
        let mut cur = self.free_list;
        while !cur.is_null() && (*cur).start < (*bd).start {
            prev = cur;
            cur = (*cur).link;
        }
        (*bd).link = cur;
        if prev.is_null() {
            self.free_list = bd;
        } else {
            (*prev).link = bd;
        }
        // forward merge
        if !cur.is_null() && Self::contiguous(bd, cur) {
            (*bd).blocks += (*cur).blocks;
            (*bd).link = (*cur).link;
        }
        // backward merge
        if !prev.is_null() && Self::contiguous(prev, bd) {
            (*prev).blocks += (*bd).blocks;
            (*prev).link = (*bd).link;
        }
    }

    unsafe fn contiguous(a: *const BlockDescr, b: *const BlockDescr) -> bool {
        let a_end = (*a).start.add((*a).blocks as usize * BLOCK_SIZE_W);
        a_end == (*b).start
            && ((*a).start as usize & !MBLOCK_MASK) == ((*b).start as usize & !MBLOCK_MASK)
    }

    /// Reset a group for use: bump pointer at the payload start, tail
    /// descriptors zeroed so a stale chain walk cannot miscount them.
    unsafe fn init_group(&self, head: *mut BlockDescr) {
        (*head).free = (*head).start;
        (*head).link = null_mut();
        (*head).back = null_mut();
        (*head).flags = 0;
        let blocks = (*head).blocks as usize;
        let in_mblock =
            (BLOCKS_PER_MBLOCK - Self::block_index_in_mblock((*head).start)).min(blocks);
        let mut tail = head.add(1);
        for _ in 1..in_mblock {
            (*tail).free = null_mut();
            (*tail).blocks = 0;
            (*tail).flags = 0;
            tail = tail.add(1);
        }
    }

    fn block_index_in_mblock(start: *mut Word) -> usize {
        ((start as usize & MBLOCK_MASK) - FIRST_BLOCK_OFF) / BLOCK_SIZE
    }

    /// Map `n` contiguous megablocks and lay out the first one's
    /// descriptor table. Returns the descriptor of the first payload
    /// block; its `blocks` field is left to the caller.
    unsafe fn alloc_mblocks(&mut self, n: usize) -> *mut BlockDescr {
        let map = Mmap::new(n * MBLOCK_SIZE + MBLOCK_SIZE, MBLOCK_SIZE);
        let base = map.aligned();
        logln_if!(self.trace, "block_alloc: mapped {} megablock(s) at {:p}", n, base);
        // Descriptor slots cover the whole first megablock; point each at
        // its block.
        for i in 0..MBLOCK_SIZE / BLOCK_SIZE {
            let off = i * BLOCK_SIZE;
            if off < FIRST_BLOCK_OFF {
                continue;
            }
            let desc = base.add(off >> (BLOCK_SHIFT - BDESCR_SHIFT)) as *mut BlockDescr;
            core::ptr::write_bytes(desc, 0, 1);
            (*desc).start = base.add(off) as *mut Word;
        }
        self.mblocks.push(map);
        bdescr(base.add(FIRST_BLOCK_OFF) as *const Word)
    }

    unsafe fn alloc_mega_group(&mut self, n_blocks: usize) -> *mut BlockDescr {
        let extra = n_blocks - BLOCKS_PER_MBLOCK;
        let n_mblocks = 1 + (extra * BLOCK_SIZE + MBLOCK_SIZE - 1) / MBLOCK_SIZE;
        let head = self.alloc_mblocks(n_mblocks);
        (*head).blocks = mblock_group_blocks(n_mblocks) as u32;
        (*head).free = (*head).start;
        (*head).link = null_mut();
        (*head).back = null_mut();
        (*head).flags = 0;
        self.n_alloc_blocks += (*head).blocks as usize;
        head
    }

    unsafe fn free_mega_group(&mut self, bd: *mut BlockDescr) {
        let base = ((*bd).start as usize & !MBLOCK_MASK) as *mut u8;
        let pos = self.mblocks.iter().position(|m| {
            let lo = m.start() as usize;
            let hi = lo + m.size();
            (base as usize) >= lo && (base as usize) < hi
        });
        match pos {
            Some(ix) => {
                logln_if!(self.trace, "block_alloc: unmapping megablock group at {:p}", base);
                self.mblocks.swap_remove(ix);
            }
            None => barf!("free_mega_group: unknown group at {:p}", base),
        }
    }
}
