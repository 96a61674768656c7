// SPDX-License-Identifier: Apache-2.0

//! Reader/writer spin latch over one 64-bit word.
//!
//! The word holds the reader count; the top bit marks a writer. Writers
//! wait for readers to drain, readers wait while a writer holds or waits.

use std::sync::atomic::{AtomicU64, Ordering};

const WRITER: u64 = 1 << 63;

/// A writer-preferring reader/writer spin latch.
#[repr(transparent)]
#[derive(Debug)]
pub struct RwSpinlock {
    word: AtomicU64,
}

impl RwSpinlock {
    /// Creates an unlocked latch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Reinterprets a synchronization word as a latch.
    #[must_use]
    pub fn from_word(word: &AtomicU64) -> &Self {
        // Safety: repr(transparent) over AtomicU64.
        unsafe { &*(word as *const AtomicU64).cast::<RwSpinlock>() }
    }

    /// Acquires the latch shared.
    pub fn lock_shared(&self) {
        loop {
            let current = self.word.load(Ordering::Relaxed);
            if current & WRITER == 0 {
                if self
                    .word
                    .compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Releases a shared acquisition.
    pub fn unlock_shared(&self) {
        let _ = self.word.fetch_sub(1, Ordering::Release);
    }

    /// Acquires the latch exclusive.
    pub fn lock_exclusive(&self) {
        // Claim the writer bit, then wait for readers to drain.
        loop {
            let current = self.word.load(Ordering::Relaxed);
            if current & WRITER == 0
                && self
                    .word
                    .compare_exchange_weak(
                        current,
                        current | WRITER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                break;
            }
            std::hint::spin_loop();
        }
        while self.word.load(Ordering::Acquire) != WRITER {
            std::hint::spin_loop();
        }
    }

    /// Releases an exclusive acquisition.
    pub fn unlock_exclusive(&self) {
        self.word.store(0, Ordering::Release);
    }
}

impl Default for RwSpinlock {
    fn default() -> Self {
        Self::new()
    }
}
