//! Runtime flags consumed by the storage manager. The enclosing runtime
//! parses its command line into this record and hands it to
//! [`StorageManager::new`](crate::storage::StorageManager::new); the
//! storage manager owns the copy and may reconcile inconsistent settings
//! at init time.

/// Heap-shape and collection-policy knobs (the `+RTS -G/-T/-A/-M/-H`
/// family on the runtime's command line).
#[derive(Clone, Debug)]
pub struct GcFlags {
    /// Number of generations. Must be at least 1.
    pub generations: usize,
    /// Steps per generation (the oldest generation always has exactly one).
    pub steps: usize,
    /// Initial/minimum allocation area per capability, in blocks.
    pub min_alloc_area_size: usize,
    /// Hard heap cap in blocks; 0 means unlimited.
    pub max_heap_size: usize,
    /// Suggested heap size in blocks; 0 means none.
    pub heap_size_suggestion: usize,
    /// Compact the oldest generation instead of copying.
    pub compact: bool,
    /// Mark/sweep the oldest generation instead of copying.
    pub sweep: bool,
}

/// Debug output switches. All off in production.
#[derive(Clone, Copy, Debug, Default)]
pub struct DebugFlags {
    /// Trace storage/GC bookkeeping to stderr.
    pub gc: bool,
    /// Expensive heap sanity checking and nursery poisoning.
    pub sanity: bool,
    /// Trace the block allocator.
    pub block_alloc: bool,
}

#[derive(Clone, Debug)]
pub struct RtsFlags {
    pub gc: GcFlags,
    pub debug: DebugFlags,
}

impl Default for GcFlags {
    fn default() -> Self {
        Self {
            generations: 2,
            steps: 2,
            min_alloc_area_size: 128,
            max_heap_size: 0,
            heap_size_suggestion: 0,
            compact: false,
            sweep: false,
        }
    }
}

impl Default for RtsFlags {
    fn default() -> Self {
        Self {
            gc: GcFlags::default(),
            debug: DebugFlags::default(),
        }
    }
}
