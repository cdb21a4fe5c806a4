//! The storage manager: heap topology, lifecycle and the allocator.
//!
//! All process-wide storage state lives in one [`StorageManager`] value.
//! Global mutation is serialized by the coarse storage-manager lock
//! (`sm_lock`); the allocation fast path stays off it entirely, working
//! only on blocks owned by the calling capability.

use crate::block::*;
use crate::block_alloc::BlockAllocator;
use crate::capability::Capability;
use crate::closure::*;
use crate::flags::RtsFlags;
use crate::sanity;
use crate::sync::SpinLock;
use crate::Word;
use atomic::Atomic;
use parking_lot::{lock_api::RawMutex, RawMutex as Mutex};
use std::mem::size_of;
use std::ptr::null_mut;

/// Process exit code used when an allocation would exceed the configured
/// maximum heap size.
pub const EXIT_HEAPOVERFLOW: i32 = 251;

/// One bucket within a generation. Steps sequence promotion: an object
/// surviving a collection of its step moves to `to`.
#[repr(C)]
pub struct Step {
    /// Index within the owning generation.
    pub no: usize,
    /// Linear index across all steps. Steps live in one contiguous
    /// array, so `a.abs_no < b.abs_no` iff `a` is strictly younger and
    /// two step pointers compare directly by age.
    pub abs_no: usize,
    pub gen: *mut Generation,
    pub gen_no: usize,
    /// Promotion destination; the oldest step points at itself.
    pub to: *mut Step,

    /// Small-object region: doubly-linked chain plus its counters.
    pub blocks: *mut BlockDescr,
    pub n_blocks: usize,
    pub n_words: usize,
    pub live_estimate: usize,

    /// From-space buffer while a collection is in progress.
    pub old_blocks: *mut BlockDescr,
    pub n_old_blocks: usize,

    pub large_objects: *mut BlockDescr,
    pub n_large_blocks: usize,
    pub scavenged_large_objects: *mut BlockDescr,
    pub n_scavenged_large_blocks: usize,

    /// Oldest-generation policy: mark instead of copy, and optionally
    /// compact in place.
    pub mark: bool,
    pub compact: bool,
    pub bitmap: *mut Word,

    pub threads: *mut Tso,
    pub old_threads: *mut Tso,

    /// Guards `large_objects` during parallel collection; mutator-side
    /// linkage relies on capability ownership instead.
    pub sync_large_objects: SpinLock,
}

/// A set of steps collected together. Older generations collect less
/// often; `mut_list` remembers references into this generation from
/// elsewhere so younger collections can treat them as roots.
#[repr(C)]
pub struct Generation {
    pub no: usize,
    pub steps: *mut Step,
    pub n_steps: usize,
    pub mut_list: *mut BlockDescr,
    pub collections: usize,
    pub par_collections: usize,
    pub failed_promotions: usize,
    /// Target block count set after the last major collection.
    pub max_blocks: usize,
}

pub struct StorageManager {
    pub flags: RtsFlags,
    /// Storage-manager lock: guards the block allocator and every global
    /// list. Never taken on the allocation fast path.
    pub(crate) sm_lock: Mutex,
    pub(crate) block_alloc: BlockAllocator,

    generations: *mut Generation,
    n_generations: usize,
    all_steps: *mut Step,
    total_steps: usize,
    nurseries: *mut Step,
    n_capabilities: usize,
    g0: *mut Generation,
    oldest_gen: *mut Generation,

    pub(crate) caf_list: *mut Closure,
    pub(crate) revertible_caf_list: *mut Closure,
    pub(crate) keep_cafs: bool,

    /// Collection trigger: GC when a nursery's large blocks reach this.
    pub alloc_blocks_lim: usize,
    pub(crate) exec_block: *mut BlockDescr,
    pub(crate) total_allocated: u64,

    /// Constructed here, owned by the collector.
    pub gc_alloc_block_sync: SpinLock,
    pub whitehole_spin: Atomic<usize>,

    /// Called when a single request exceeds the configured heap cap. May
    /// not exit; the allocator terminates afterwards regardless.
    pub heap_overflow_hook: fn(),
}

unsafe impl Send for StorageManager {}

fn default_heap_overflow() {
    eprintln!("rime: heap exhausted: current maximum heap size reached");
}

impl StorageManager {
    /// An empty storage manager. Nothing is usable until
    /// [`init_storage`](Self::init_storage) runs.
    pub fn new(flags: RtsFlags, n_capabilities: usize) -> Self {
        assert!(flags.gc.generations >= 1, "need at least one generation");
        assert!(flags.gc.steps >= 1, "need at least one step per generation");
        assert!(n_capabilities >= 1);
        Self {
            flags,
            sm_lock: Mutex::INIT,
            block_alloc: BlockAllocator::new(false),
            generations: null_mut(),
            n_generations: 0,
            all_steps: null_mut(),
            total_steps: 0,
            nurseries: null_mut(),
            n_capabilities,
            g0: null_mut(),
            oldest_gen: null_mut(),
            caf_list: null_mut(),
            revertible_caf_list: null_mut(),
            keep_cafs: false,
            alloc_blocks_lim: 0,
            exec_block: null_mut(),
            total_allocated: 0,
            gc_alloc_block_sync: SpinLock::new(),
            whitehole_spin: Atomic::new(0),
            heap_overflow_hook: default_heap_overflow,
        }
    }

    /// Build the generational layout, the nurseries and the registries.
    /// Idempotent: a second call is a no-op.
    pub fn init_storage(&mut self) {
        if !self.generations.is_null() {
            // multi-init protection
            return;
        }

        // The pointer-classification predicates must accept the closures
        // the runtime is built out of before any heap exists.
        if cfg!(debug_assertions) {
            assert!(looks_like_info_ptr(&BLACKHOLE_INFO));
            let probe = Closure { info: &THUNK_INFO };
            assert!(looks_like_closure_ptr(&probe));
            assert!(!self.block_alloc.contains(&probe as *const _ as usize));
        }

        // Reconcile the heap-size policy before anything is sized off it.
        let gcf = &mut self.flags.gc;
        if gcf.max_heap_size != 0 && gcf.heap_size_suggestion > gcf.max_heap_size {
            gcf.max_heap_size = gcf.heap_size_suggestion;
        }
        if gcf.max_heap_size != 0 && gcf.min_alloc_area_size > gcf.max_heap_size {
            eprintln!("rime: maximum heap size is smaller than minimum alloc area size");
            gcf.min_alloc_area_size = gcf.max_heap_size;
        }

        let n_gens = self.flags.gc.generations;
        let steps_per_gen = self.flags.gc.steps;
        self.block_alloc = BlockAllocator::new(self.flags.debug.block_alloc);

        self.sm_lock.lock();

        let mut gens: Vec<Generation> = (0..n_gens)
            .map(|g| Generation {
                no: g,
                steps: null_mut(),
                n_steps: 0,
                mut_list: null_mut(),
                collections: 0,
                par_collections: 0,
                failed_promotions: 0,
                max_blocks: 0,
            })
            .collect();
        for gen in gens.iter_mut() {
            gen.mut_list = self.block_alloc.alloc_block();
        }
        self.n_generations = n_gens;
        self.generations = Box::into_raw(gens.into_boxed_slice()) as *mut Generation;

        unsafe {
            self.g0 = self.generations;
            self.oldest_gen = self.generations.add(n_gens - 1);

            // All steps go into a single contiguous array so that two step
            // pointers compare directly by age. The oldest generation has
            // exactly one step.
            self.total_steps = 1 + (n_gens - 1) * steps_per_gen;
            let steps: Vec<Step> = (0..self.total_steps).map(|_| Step::unlinked()).collect();
            self.all_steps = Box::into_raw(steps.into_boxed_slice()) as *mut Step;

            if n_gens > 1 {
                (*self.oldest_gen).n_steps = 1;
                (*self.oldest_gen).steps = self.all_steps.add((n_gens - 1) * steps_per_gen);
                for g in 0..n_gens - 1 {
                    let gen = self.generations.add(g);
                    (*gen).n_steps = steps_per_gen;
                    (*gen).steps = self.all_steps.add(g * steps_per_gen);
                }
            } else {
                (*self.g0).n_steps = 1;
                (*self.g0).steps = self.all_steps;
            }

            let nurseries: Vec<Step> = (0..self.n_capabilities)
                .map(|_| Step::unlinked())
                .collect();
            self.nurseries = Box::into_raw(nurseries.into_boxed_slice()) as *mut Step;

            for g in 0..n_gens {
                let gen = self.generations.add(g);
                for s in 0..(*gen).n_steps {
                    self.init_step((*gen).steps.add(s), g, s);
                }
            }
            for i in 0..self.n_capabilities {
                self.init_step(self.nurseries.add(i), 0, i);
            }

            // Promotion destinations: younger step to the next step, last
            // step of a generation to the next generation's first step,
            // oldest step to itself.
            for g in 0..n_gens.saturating_sub(1) {
                let gen = self.generations.add(g);
                let n = (*gen).n_steps;
                for s in 0..n - 1 {
                    (*(*gen).steps.add(s)).to = (*gen).steps.add(s + 1);
                }
                (*(*gen).steps.add(n - 1)).to = (*self.generations.add(g + 1)).steps;
            }
            let oldest_step = (*self.oldest_gen).steps;
            (*oldest_step).to = oldest_step;

            for i in 0..self.n_capabilities {
                (*self.nurseries.add(i)).to = (*(*self.g0).steps).to;
            }

            if self.flags.gc.compact || self.flags.gc.sweep {
                if n_gens == 1 {
                    eprintln!("rime: WARNING: compact/sweep is incompatible with one generation; disabled");
                } else {
                    (*oldest_step).mark = true;
                    if self.flags.gc.compact {
                        (*oldest_step).compact = true;
                    }
                }
            }

            (*self.g0).max_blocks = 0;
        }

        // Keep the allocation area small to begin with even when a large
        // heap was suggested: the first major collection should be cheap.
        self.alloc_nurseries();

        self.caf_list = null_mut();
        self.revertible_caf_list = null_mut();

        self.alloc_blocks_lim = self.flags.gc.min_alloc_area_size;
        self.exec_block = null_mut();

        self.gc_alloc_block_sync = SpinLock::new();
        self.whitehole_spin = Atomic::new(0);

        unsafe {
            self.sm_lock.unlock();
        }

        if self.flags.debug.gc {
            self.describe_gens();
        }
    }

    /// Fold the final allocation figure into the running total and report
    /// it. Call once, at shutdown, before `free_storage`.
    pub fn exit_storage(&mut self, caps: &mut [Capability]) {
        let allocated = self.calc_allocated(caps);
        logln_if!(
            self.flags.debug.gc,
            "storage: {} words allocated this epoch, {} in total",
            allocated,
            self.total_allocated
        );
    }

    /// Tear everything down. Equivalent to dropping the value; provided
    /// for symmetry with `init_storage`.
    pub fn free_storage(self) {}

    // ---------------------------------------------------------------
    // topology views

    pub fn generations(&self) -> &[Generation] {
        unsafe { std::slice::from_raw_parts(self.generations, self.n_generations) }
    }

    pub fn g0(&self) -> *mut Generation {
        self.g0
    }

    pub fn oldest_gen(&self) -> *mut Generation {
        self.oldest_gen
    }

    pub fn all_steps(&self) -> &[Step] {
        unsafe { std::slice::from_raw_parts(self.all_steps, self.total_steps) }
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn nurseries(&self) -> &[Step] {
        unsafe { std::slice::from_raw_parts(self.nurseries, self.n_capabilities) }
    }

    pub fn n_capabilities(&self) -> usize {
        self.n_capabilities
    }

    pub fn total_allocated(&self) -> u64 {
        self.total_allocated
    }

    pub(crate) fn nursery_ptr(&self, i: usize) -> *mut Step {
        debug_assert!(i < self.n_capabilities);
        unsafe { self.nurseries.add(i) }
    }

    pub(crate) fn generation_ptr(&self, g: usize) -> *mut Generation {
        debug_assert!(g < self.n_generations);
        unsafe { self.generations.add(g) }
    }

    pub fn step_ptr(&self, g: usize, s: usize) -> *mut Step {
        unsafe {
            let gen = self.generation_ptr(g);
            debug_assert!(s < (*gen).n_steps);
            (*gen).steps.add(s)
        }
    }

    // ---------------------------------------------------------------
    // allocation

    /// Allocate `n` words on behalf of `cap`.
    ///
    /// Requests at or above the large-object threshold get their own
    /// block group, chained onto the capability's nursery `large_objects`
    /// list; the capability owns that list during mutation, so only the
    /// block allocator call itself takes the SM lock. Everything else is
    /// bump allocation in the capability's current alloc block, refilled
    /// from the nursery (skipping the block the mutator's `Hp` registers
    /// live in) or, when the nursery is spent, from a fresh block under
    /// the SM lock.
    pub fn allocate(&mut self, cap: &mut Capability, n: usize) -> *mut Word {
        unsafe {
            if n >= LARGE_OBJECT_THRESHOLD / size_of::<Word>() {
                let req_blocks = block_round_up(n * size_of::<Word>()) / BLOCK_SIZE;

                // Refusing is the only option: the user asked for a cap
                // and allocating would break it.
                if self.flags.gc.max_heap_size > 0
                    && req_blocks >= self.flags.gc.max_heap_size
                {
                    (self.heap_overflow_hook)();
                    std::process::exit(EXIT_HEAPOVERFLOW);
                }

                let stp = self.nursery_ptr(cap.no);

                self.sm_lock.lock();
                let bd = self.block_alloc.alloc_group(req_blocks);
                self.sm_lock.unlock();

                dbl_link_onto(bd, &mut (*stp).large_objects);
                // the group may be wider than requested
                (*stp).n_large_blocks += (*bd).blocks as usize;
                (*bd).init_into(stp);
                (*bd).flags = BF_LARGE;
                (*bd).free = (*bd).start.add(n);
                return (*bd).start;
            }

            cap.tick_alloc_heap(n);

            let mut bd = cap.r.current_alloc;
            if bd.is_null() || !Self::fits(bd, n) {
                // Refill. First try the block after the one the mutator's
                // Hp/HpLim registers are using; taking that one would
                // interfere with the hot pointers.
                bd = if cap.r.current_nursery.is_null() {
                    null_mut()
                } else {
                    (*cap.r.current_nursery).link
                };

                if bd.is_null() || !Self::fits(bd, n) {
                    // Nursery spent (or next block too full): take a fresh
                    // block. Leaving `current_nursery.link` null makes the
                    // scheduler's allocation check trigger a collection
                    // soon.
                    self.sm_lock.lock();
                    bd = self.block_alloc.alloc_block();
                    (*cap.r.nursery).n_blocks += 1;
                    self.sm_lock.unlock();
                    (*bd).init_into(cap.r.nursery);
                    (*bd).flags = 0;
                } else {
                    // Splice it out of the nursery's forward chain.
                    (*cap.r.current_nursery).link = (*bd).link;
                    if !(*bd).link.is_null() {
                        (*(*bd).link).back = cap.r.current_nursery;
                    }
                }
                dbl_link_onto(bd, &mut (*cap.r.nursery).blocks);
                cap.r.current_alloc = bd;
                if self.flags.debug.sanity {
                    sanity::check_nursery_sanity(cap.r.nursery);
                }
            }

            let p = (*bd).free;
            (*bd).free = (*bd).free.add(n);
            p
        }
    }

    /// Allocate `n` words whose address must survive collections.
    ///
    /// Pinned objects go into per-capability blocks flagged
    /// `PINNED | LARGE`: the collector then moves the block, never the
    /// contents. Only safe for pointer-free payloads, since the collector
    /// will not scavenge past the first object in the block.
    pub fn allocate_pinned(&mut self, cap: &mut Capability, n: usize) -> *mut Word {
        unsafe {
            // A large request comes back pinned for free.
            if n >= LARGE_OBJECT_THRESHOLD / size_of::<Word>() {
                let p = self.allocate(cap, n);
                (*bdescr(p)).flags |= BF_PINNED;
                return p;
            }

            cap.tick_alloc_heap(n);

            let mut bd = cap.pinned_object_block;
            if bd.is_null() || !Self::fits(bd, n) {
                self.sm_lock.lock();
                bd = self.block_alloc.alloc_block();
                self.sm_lock.unlock();
                cap.pinned_object_block = bd;

                let stp = self.nursery_ptr(cap.no);
                dbl_link_onto(bd, &mut (*stp).large_objects);
                (*stp).n_large_blocks += 1;
                (*bd).init_into(stp);
                (*bd).flags = BF_PINNED | BF_LARGE;
                (*bd).free = (*bd).start;
            }

            let p = (*bd).free;
            (*bd).free = (*bd).free.add(n);
            p
        }
    }

    /// Carve `blocks` off the front of large group `bd`, leaving the
    /// remainder as its own group on the same step's `large_objects`
    /// list. Returns the remainder (null when `blocks == bd.blocks`).
    /// Counters are recomputed from both halves because descriptor gaps
    /// can change the total.
    pub fn split_large_block(&mut self, bd: *mut BlockDescr, blocks: usize) -> *mut BlockDescr {
        unsafe {
            self.sm_lock.lock();

            let stp = (*bd).step;
            debug_assert!((*bd).flags & BF_LARGE != 0);
            debug_assert!(blocks <= (*bd).blocks as usize);
            debug_assert_eq!(
                count_blocks((*stp).large_objects),
                (*stp).n_large_blocks
            );

            // take the original width out of the counter first
            (*stp).n_large_blocks -= (*bd).blocks as usize;

            let new_bd = if blocks < (*bd).blocks as usize {
                let new_bd = self.block_alloc.split_block_group(bd, blocks);
                (*new_bd).init_into(stp);
                (*new_bd).flags = BF_LARGE | ((*bd).flags & BF_EVACUATED);
                (*new_bd).free = (*bd).free;
                dbl_link_onto(new_bd, &mut (*stp).large_objects);
                new_bd
            } else {
                null_mut()
            };

            // put back the widths of both halves
            (*stp).n_large_blocks += (*bd).blocks as usize;
            if !new_bd.is_null() {
                (*stp).n_large_blocks += (*new_bd).blocks as usize;
            }

            debug_assert_eq!(
                count_blocks((*stp).large_objects),
                (*stp).n_large_blocks
            );

            self.sm_lock.unlock();
            new_bd
        }
    }

    /// Allocate one block under the SM lock.
    pub(crate) fn alloc_block_lock(&mut self) -> *mut BlockDescr {
        self.sm_lock.lock();
        let bd = self.block_alloc.alloc_block();
        unsafe {
            self.sm_lock.unlock();
        }
        bd
    }

    #[inline(always)]
    unsafe fn fits(bd: *mut BlockDescr, n: usize) -> bool {
        ((*bd).free as usize) + n * size_of::<Word>()
            <= ((*bd).start as usize) + BLOCK_SIZE
    }

    // ---------------------------------------------------------------
    // internals

    unsafe fn init_step(&mut self, stp: *mut Step, g: usize, s: usize) {
        stp.write(Step::unlinked());
        (*stp).no = s;
        (*stp).abs_no = self.flags.gc.steps * g + s;
        (*stp).gen = self.generations.add(g);
        (*stp).gen_no = g;
    }
}

impl Step {
    fn unlinked() -> Self {
        Self {
            no: 0,
            abs_no: 0,
            gen: null_mut(),
            gen_no: 0,
            to: null_mut(),
            blocks: null_mut(),
            n_blocks: 0,
            n_words: 0,
            live_estimate: 0,
            old_blocks: null_mut(),
            n_old_blocks: 0,
            large_objects: null_mut(),
            n_large_blocks: 0,
            scavenged_large_objects: null_mut(),
            n_scavenged_large_blocks: 0,
            mark: false,
            compact: false,
            bitmap: null_mut(),
            threads: end_tso_queue(),
            old_threads: end_tso_queue(),
            sync_large_objects: SpinLock::new(),
        }
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        unsafe {
            if !self.all_steps.is_null() {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.all_steps,
                    self.total_steps,
                )));
                self.all_steps = null_mut();
            }
            if !self.nurseries.is_null() {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.nurseries,
                    self.n_capabilities,
                )));
                self.nurseries = null_mut();
            }
            if !self.generations.is_null() {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.generations,
                    self.n_generations,
                )));
                self.generations = null_mut();
            }
            // every block group goes away with the block allocator's
            // reservations
        }
    }
}
