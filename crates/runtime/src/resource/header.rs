// SPDX-License-Identifier: Apache-2.0

//! The in-band header preceding every built resource.
//!
//! The header holds the one synchronization word the resource's primitive
//! interprets, plus the reclamation linkage for optimistic resources. It is
//! exactly one cache line, so the user object that follows it is always
//! cache-line aligned and the tagged pointer's address bits can be mapped
//! back to the header with a constant offset.

use crate::sync::optimistic::OptimisticLock;
use crate::sync::rw_spinlock::RwSpinlock;
use crate::sync::spinlock::Spinlock;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use taskmill_alloc::GarbageNode;

/// Distance from the header to the user object the tagged pointer names.
pub const RESOURCE_HEADER_SIZE: usize = 64;

/// Header preceding the user object of every built resource.
#[repr(C, align(64))]
pub struct ResourceHeader {
    /// Interpreted per the resource's primitive tag.
    sync_word: AtomicU64,
    /// Reclamation linkage; used only by optimistic resources.
    garbage: GarbageNode,
}

impl ResourceHeader {
    /// Creates a header with an unlocked synchronization word.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sync_word: AtomicU64::new(0),
            garbage: GarbageNode::new(),
        }
    }

    /// The header that precedes the given user object.
    ///
    /// # Safety
    /// `user` must be the address carried by a tagged pointer of a built
    /// resource (the builder places the header exactly
    /// [`RESOURCE_HEADER_SIZE`] bytes before it).
    #[must_use]
    pub unsafe fn from_user_ptr(user: NonNull<u8>) -> NonNull<ResourceHeader> {
        // Safety: layout contract of the builder.
        unsafe { NonNull::new_unchecked(user.as_ptr().sub(RESOURCE_HEADER_SIZE)).cast() }
    }

    /// The user object following this header.
    #[must_use]
    pub fn user_ptr(&self) -> NonNull<u8> {
        // Safety: a live header is never at the null page.
        unsafe {
            NonNull::new_unchecked(((self as *const Self) as *mut u8).add(RESOURCE_HEADER_SIZE))
        }
    }

    /// View of the synchronization word as an exclusive latch.
    #[must_use]
    pub fn exclusive_latch(&self) -> &Spinlock {
        Spinlock::from_word(&self.sync_word)
    }

    /// View of the synchronization word as a reader/writer latch.
    #[must_use]
    pub fn rw_latch(&self) -> &RwSpinlock {
        RwSpinlock::from_word(&self.sync_word)
    }

    /// View of the synchronization word as an optimistic version latch.
    #[must_use]
    pub fn optimistic_latch(&self) -> &OptimisticLock {
        OptimisticLock::from_word(&self.sync_word)
    }

    /// The reclamation node of this resource.
    #[must_use]
    pub fn garbage_node(&self) -> NonNull<GarbageNode> {
        NonNull::from(&self.garbage)
    }

    /// The header containing the given reclamation node.
    ///
    /// # Safety
    /// `node` must be the `garbage` field of a live [`ResourceHeader`].
    #[must_use]
    pub unsafe fn from_garbage_node(node: NonNull<GarbageNode>) -> NonNull<ResourceHeader> {
        let offset = std::mem::offset_of!(ResourceHeader, garbage);
        // Safety: layout contract above.
        unsafe { NonNull::new_unchecked(node.as_ptr().cast::<u8>().sub(offset)).cast() }
    }
}

impl Default for ResourceHeader {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(size_of::<ResourceHeader>() == RESOURCE_HEADER_SIZE);
const _: () = assert!(align_of::<ResourceHeader>() == 64);
