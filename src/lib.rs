//! # Rime storage manager
//!
//! Front-end of the Rime runtime's memory subsystem. It hands heap memory
//! to mutator capabilities, organizes that memory into a generational,
//! stepped collector layout, tracks pinned and large objects, keeps the
//! CAF root registries, implements the mutator write barriers and provides
//! a separate page-granular allocator for executable code.
//!
//! The collector itself (scavenging/evacuation), the thread scheduler and
//! profiling all live elsewhere in the runtime; this crate only owns the
//! storage layout and the allocation paths.
//!
//! Entry point is [`StorageManager`](storage::StorageManager): one value,
//! created once, holding every piece of process-wide storage state behind
//! the storage-manager lock. Mutator fast paths go through a
//! [`Capability`](capability::Capability) and never take that lock.

#[macro_use]
pub mod utils;
pub mod barrier;
pub mod block;
pub mod block_alloc;
pub mod caf;
pub mod capability;
pub mod closure;
pub mod exec;
pub mod flags;
pub mod mmap;
pub mod nursery;
pub mod sanity;
pub mod stats;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod tests;

/// Machine word, the unit every heap size in this crate is measured in.
pub type Word = usize;

pub use block::{BlockDescr, BLOCK_SIZE, BLOCK_SIZE_W, LARGE_OBJECT_THRESHOLD};
pub use capability::Capability;
pub use flags::RtsFlags;
pub use storage::StorageManager;
