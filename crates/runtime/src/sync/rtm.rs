// SPDX-License-Identifier: Apache-2.0

//! Restricted transactional memory with a latch fallback.
//!
//! The discipline is fixed per resource: an aborted hardware transaction
//! is retried once transactionally, then the body runs under the embedded
//! exclusive latch. Without the `rtm` cargo feature (or on non-x86-64
//! targets) the transactional attempts are compiled out and every
//! execution takes the latch path, which preserves the semantics.

use crate::sync::spinlock::Spinlock;

/// Transactional attempts before the latch fallback.
#[cfg(all(feature = "rtm", target_arch = "x86_64"))]
const TRANSACTION_ATTEMPTS: usize = 2;

/// Executes `body` transactionally with `latch` as the fallback.
///
/// The body is bound as [`Fn`] because an aborted transaction rolls its
/// effects back and the body runs again — transactionally on the retry,
/// or under the latch once the attempts are exhausted.
///
/// Inside a successful transaction the latch is subscribed: a concurrent
/// lock holder aborts the transaction, which is what makes the fallback
/// mutually exclusive with transactional executions.
pub fn execute<R>(latch: &Spinlock, body: impl Fn() -> R) -> R {
    #[cfg(all(feature = "rtm", target_arch = "x86_64"))]
    {
        for _ in 0..TRANSACTION_ATTEMPTS {
            if let Some(result) = try_transactional(latch, &body) {
                return result;
            }
        }
    }
    latch.with(body)
}

#[cfg(all(feature = "rtm", target_arch = "x86_64"))]
fn try_transactional<R>(latch: &Spinlock, body: &impl Fn() -> R) -> Option<R> {
    // One attempt, then the caller retries or falls back to the latch.
    // Safety: _xbegin/_xend are safe to issue; an abort rolls back every
    // transactional write and resumes at _xbegin with the abort code.
    unsafe {
        use std::arch::x86_64::{_XBEGIN_STARTED, _xabort, _xbegin, _xend};

        if _xbegin() == _XBEGIN_STARTED {
            if latch.is_locked() {
                _xabort(0xFF);
            }
            let result = body();
            _xend();
            return Some(result);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_fallback_path_is_exclusive() {
        let latch = Arc::new(Spinlock::new());
        let counter = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        execute(&latch, || {
                            let value = counter.load(Ordering::Relaxed);
                            counter.store(value + 1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }

    #[test]
    fn test_returns_body_result() {
        let latch = Spinlock::new();
        assert_eq!(execute(&latch, || 42), 42);
        assert!(!latch.is_locked());
    }
}
