// SPDX-License-Identifier: Apache-2.0

//! Optimistic version latch over one 64-bit word.
//!
//! The word is a monotonic version counter; the low bit marks a writer in
//! progress. Readers snapshot an even version, run, and revalidate: any
//! intervening writer leaves a different (and again even) version behind.
//! Writers acquire the low bit, mutate, and release by publishing the next
//! even version.

use std::sync::atomic::{AtomicU64, Ordering};

/// A version snapshot taken by a reader.
pub type Version = u64;

const LOCKED: u64 = 1;

/// The optimistic latch backing `Optimistic`, `Olfit` and the reader side
/// of `ScheduleWriter` resources.
#[repr(transparent)]
#[derive(Debug)]
pub struct OptimisticLock {
    word: AtomicU64,
}

impl OptimisticLock {
    /// Creates an unlocked latch at version 0.
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
        unsafe { &*(word as *const AtomicU64).cast::<OptimisticLock>() }
    }

    /// Snapshots a valid (even) version, spinning past an in-flight writer.
    #[must_use]
    pub fn read_valid(&self) -> Version {
        loop {
            let version = self.word.load(Ordering::Acquire);
            if version & LOCKED == 0 {
                return version;
            }
            std::hint::spin_loop();
        }
    }

    /// True when the snapshot is still the current version.
    #[must_use]
    pub fn is_valid(&self, version: Version) -> bool {
        self.word.load(Ordering::Acquire) == version
    }

    /// Tries to acquire the writer latch.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        let version = self.word.load(Ordering::Relaxed);
        if version & LOCKED != 0 {
            return false;
        }
        self.word
            .compare_exchange(
                version,
                version | LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Acquires the writer latch, spinning until it is free.
    pub fn lock(&self) {
        while !self.try_lock() {
            std::hint::spin_loop();
        }
    }

    /// Releases the writer latch, publishing the next even version.
    pub fn unlock(&self) {
        let version = self.word.load(Ordering::Relaxed);
        debug_assert!(version & LOCKED != 0);
        self.word.store(version.wrapping_add(1), Ordering::Release);
    }

    /// True while a writer holds the latch.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) & LOCKED != 0
    }
}

impl Default for OptimisticLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_versions_stay_even_for_readers() {
        let latch = OptimisticLock::new();
        let v0 = latch.read_valid();
        assert_eq!(v0 % 2, 0);
        latch.lock();
        assert!(latch.is_locked());
        assert!(!latch.is_valid(v0));
        latch.unlock();
        let v1 = latch.read_valid();
        assert_eq!(v1 % 2, 0);
        assert!(v1 > v0);
    }

    #[test]
    fn test_reader_detects_intervening_writer() {
        let latch = OptimisticLock::new();
        let snapshot = latch.read_valid();
        latch.lock();
        latch.unlock();
        assert!(!latch.is_valid(snapshot));
        assert!(latch.is_valid(latch.read_valid()));
    }

    #[test]
    fn test_concurrent_readers_never_observe_torn_state() {
        let latch = Arc::new(OptimisticLock::new());
        let cells = Arc::new((AtomicU64::new(0), AtomicU64::new(0)));

        let writer = {
            let latch = Arc::clone(&latch);
            let cells = Arc::clone(&cells);
            std::thread::spawn(move || {
                for i in 1..=5_000u64 {
                    latch.lock();
                    cells.0.store(i, Ordering::Relaxed);
                    cells.1.store(i, Ordering::Relaxed);
                    latch.unlock();
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                let cells = Arc::clone(&cells);
                std::thread::spawn(move || {
                    for _ in 0..5_000 {
                        // Retry loop: take a snapshot, read, revalidate.
                        loop {
                            let version = latch.read_valid();
                            let a = cells.0.load(Ordering::Relaxed);
                            let b = cells.1.load(Ordering::Relaxed);
                            if latch.is_valid(version) {
                                assert_eq!(a, b);
                                break;
                            }
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
