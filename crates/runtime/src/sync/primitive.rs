// SPDX-License-Identifier: Apache-2.0

//! The synchronization vocabulary: primitives, isolation levels, protocol
//! hints, and the selector that maps annotations to a primitive.

use crate::resource::annotation::{ReadWriteRatio, ResourceAnnotation};

/// The concurrency-control discipline chosen for a resource.
///
/// Encoded in 4 bits of the tagged resource pointer; the discriminants are
/// stable wire values and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Primitive {
    /// No synchronization; the resource is not shared.
    None = 0,
    /// Every access is serialized by scheduling onto the home worker.
    ScheduleAll = 1,
    /// Writers are serialized on the home worker; readers run anywhere and
    /// validate against the resource's version.
    ScheduleWriter = 2,
    /// Accesses acquire the embedded exclusive latch.
    ExclusiveLatch = 3,
    /// Readers share, writers exclude, via the embedded latch.
    ReaderWriterLatch = 4,
    /// Optimistic version validation; writers latch internally.
    Optimistic = 5,
    /// Optimistic latch-free index traversal: like [`Primitive::Optimistic`]
    /// with restart-on-mismatch traversal semantics.
    Olfit = 6,
    /// Like [`Primitive::ScheduleAll`], with consecutive tasks for the same
    /// resource executed back-to-back.
    Batched = 7,
    /// Hardware memory transaction with exclusive-latch fallback.
    Rtm = 8,
}

impl Primitive {
    /// Decodes the 4-bit wire value.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Primitive::ScheduleAll,
            2 => Primitive::ScheduleWriter,
            3 => Primitive::ExclusiveLatch,
            4 => Primitive::ReaderWriterLatch,
            5 => Primitive::Optimistic,
            6 => Primitive::Olfit,
            7 => Primitive::Batched,
            8 => Primitive::Rtm,
            _ => Primitive::None,
        }
    }

    /// The 4-bit wire value.
    #[must_use]
    pub fn to_bits(self) -> u8 {
        self as u8
    }

    /// True for primitives whose readers validate versions and whose
    /// deletions must go through epoch-based reclamation.
    #[must_use]
    pub fn is_optimistic(self) -> bool {
        matches!(
            self,
            Primitive::Optimistic | Primitive::Olfit | Primitive::ScheduleWriter
        )
    }

    /// True for primitives that serialize by steering tasks to the home
    /// worker.
    #[must_use]
    pub fn is_home_scheduled(self) -> bool {
        matches!(
            self,
            Primitive::ScheduleAll | Primitive::ScheduleWriter | Primitive::Batched
        )
    }
}

/// Isolation requirement a resource declares at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// No isolation; concurrent access is the caller's problem.
    #[default]
    None,
    /// Writers must be isolated from each other; readers may run
    /// concurrently with a writer.
    ExclusiveWriter,
    /// Every access must be exclusive.
    Exclusive,
}

/// Protocol preference a resource may declare at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// No preference; the selector decides from the other hints.
    #[default]
    None,
    /// Serialize through the home worker's queue.
    Queue,
    /// Use an embedded latch.
    Latch,
    /// Serialize through the home worker, batching per resource.
    Batched,
    /// Optimistic latch-free index traversal.
    Olfit,
    /// Hardware transactional memory.
    Rtm,
}

/// Maps a resource annotation to the primitive that disciplines it.
///
/// A declared protocol wins within its isolation level; without one the
/// read/write ratio decides between the optimistic flavors and writer
/// scheduling.
#[must_use]
pub fn select_primitive(annotation: &ResourceAnnotation) -> Primitive {
    match annotation.isolation_level() {
        IsolationLevel::None => Primitive::None,
        IsolationLevel::Exclusive => match annotation.preferred_protocol() {
            Protocol::Latch => Primitive::ExclusiveLatch,
            Protocol::Batched => Primitive::Batched,
            Protocol::Rtm => Primitive::Rtm,
            _ => Primitive::ScheduleAll,
        },
        IsolationLevel::ExclusiveWriter => match annotation.preferred_protocol() {
            Protocol::Latch => Primitive::ReaderWriterLatch,
            Protocol::Olfit => Primitive::Olfit,
            Protocol::Rtm => Primitive::Rtm,
            Protocol::None => match annotation.read_write_ratio() {
                ReadWriteRatio::HeavyRead => Primitive::Optimistic,
                ReadWriteRatio::MostlyRead => Primitive::Olfit,
                _ => Primitive::ScheduleWriter,
            },
            _ => Primitive::ScheduleWriter,
        },
    }
}
