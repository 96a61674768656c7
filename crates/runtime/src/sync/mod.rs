// SPDX-License-Identifier: Apache-2.0

//! In-band synchronization primitives.
//!
//! Each resource embeds exactly one 64-bit synchronization word; the
//! primitive tag in the resource pointer decides how that word is
//! interpreted. All primitive types here are `repr(transparent)` views over
//! an [`core::sync::atomic::AtomicU64`], so a raw word can be reinterpreted
//! as whichever primitive the resource was constructed with.

pub mod optimistic;
pub mod primitive;
pub mod rtm;
pub mod rw_spinlock;
pub mod spinlock;

pub use optimistic::{OptimisticLock, Version};
pub use primitive::{IsolationLevel, Primitive, Protocol};
pub use rw_spinlock::RwSpinlock;
pub use spinlock::Spinlock;
