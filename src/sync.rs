//! Fine-grained locks. The coarse storage-manager mutex is a
//! `parking_lot::RawMutex` field on [`StorageManager`](crate::storage::StorageManager);
//! the short critical sections around per-step large-object lists and the
//! collector's allocation block use this spinlock instead.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};

/// Test-and-set spinlock. Critical sections guarded by it are a handful of
/// pointer writes, so spinning with exponential backoff beats parking.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn acquire(&self) {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }

    #[inline]
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}
