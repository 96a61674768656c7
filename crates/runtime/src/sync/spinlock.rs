// SPDX-License-Identifier: Apache-2.0

//! Exclusive spin latch over one 64-bit word.

use std::sync::atomic::{AtomicU64, Ordering};

const UNLOCKED: u64 = 0;
const LOCKED: u64 = 1;

/// A test-and-test-and-set spin latch.
///
/// `repr(transparent)` over the synchronization word so a resource header
/// can expose its word as a latch.
#[repr(transparent)]
#[derive(Debug)]
pub struct Spinlock {
    word: AtomicU64,
}

impl Spinlock {
    /// Creates an unlocked latch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(UNLOCKED),
        }
    }

    /// Reinterprets a synchronization word as a latch.
    #[must_use]
    pub fn from_word(word: &AtomicU64) -> &Self {
        // Safety: repr(transparent) over AtomicU64.
        unsafe { &*(word as *const AtomicU64).cast::<Spinlock>() }
    }

    /// Acquires the latch, spinning until it is free.
    pub fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            while self.word.load(Ordering::Relaxed) == LOCKED {
                std::hint::spin_loop();
            }
        }
    }

    /// Tries to acquire the latch without spinning.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// True while some thread holds the latch.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) == LOCKED
    }

    /// Releases the latch.
    pub fn unlock(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }

    /// Runs `body` under the latch.
    pub fn with<R>(&self, body: impl FnOnce() -> R) -> R {
        self.lock();
        let result = body();
        self.unlock();
        result
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}
