// SPDX-License-Identifier: Apache-2.0

//! Construction-time annotations of a resource.
//!
//! The annotation collects the hints the builder turns into a scheduling
//! decision and a synchronization primitive: a preferred placement, the
//! isolation requirement, the expected access frequency and read/write
//! ratio, and an optional protocol preference.

use crate::sync::primitive::{IsolationLevel, Protocol};
use taskmill_config::{NumaNodeId, WorkerId};

/// Expected access frequency of a resource, used by the builder's usage
/// prediction when placing resources round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessFrequency {
    /// The resource will dominate its worker.
    Excessive,
    /// Frequently accessed.
    High,
    /// No particular expectation.
    #[default]
    Normal,
    /// Rarely or never accessed after construction.
    Unused,
}

/// Expected read/write ratio of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadWriteRatio {
    /// Almost exclusively read.
    HeavyRead,
    /// Mostly read, some writes.
    MostlyRead,
    /// No particular skew.
    #[default]
    Balanced,
    /// Mostly written.
    MostlyWrite,
    /// Almost exclusively written.
    HeavyWrite,
}

/// Preferred placement of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementHint {
    /// Let the builder place the resource round-robin.
    #[default]
    Any,
    /// Schedule onto this worker.
    Worker(WorkerId),
    /// Allocate on this NUMA node; the builder picks a worker there.
    NumaNode(NumaNodeId),
}

/// The full construction annotation. Built fluently:
///
/// ```
/// use taskmill_runtime::{IsolationLevel, ResourceAnnotation};
///
/// let annotation = ResourceAnnotation::new()
///     .with_isolation(IsolationLevel::ExclusiveWriter)
///     .on_worker(3);
/// assert_eq!(annotation.isolation_level(), IsolationLevel::ExclusiveWriter);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceAnnotation {
    placement: PlacementHint,
    access_frequency: AccessFrequency,
    read_write_ratio: ReadWriteRatio,
    isolation_level: IsolationLevel,
    preferred_protocol: Protocol,
}

impl ResourceAnnotation {
    /// An annotation with no hints: unsynchronized, placed anywhere.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer the given worker as home.
    #[must_use]
    pub fn on_worker(mut self, worker_id: WorkerId) -> Self {
        self.placement = PlacementHint::Worker(worker_id);
        self
    }

    /// Prefer the given NUMA node for placement.
    #[must_use]
    pub fn on_numa_node(mut self, numa_node_id: NumaNodeId) -> Self {
        self.placement = PlacementHint::NumaNode(numa_node_id);
        self
    }

    /// Set the isolation requirement.
    #[must_use]
    pub fn with_isolation(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    /// Set the protocol preference.
    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.preferred_protocol = protocol;
        self
    }

    /// Set the expected access frequency.
    #[must_use]
    pub fn with_access_frequency(mut self, access_frequency: AccessFrequency) -> Self {
        self.access_frequency = access_frequency;
        self
    }

    /// Set the expected read/write ratio.
    #[must_use]
    pub fn with_read_write_ratio(mut self, read_write_ratio: ReadWriteRatio) -> Self {
        self.read_write_ratio = read_write_ratio;
        self
    }

    /// The placement hint.
    #[must_use]
    pub fn placement(&self) -> PlacementHint {
        self.placement
    }

    /// The isolation requirement.
    #[must_use]
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// The protocol preference.
    #[must_use]
    pub fn preferred_protocol(&self) -> Protocol {
        self.preferred_protocol
    }

    /// The expected access frequency.
    #[must_use]
    pub fn access_frequency(&self) -> AccessFrequency {
        self.access_frequency
    }

    /// The expected read/write ratio.
    #[must_use]
    pub fn read_write_ratio(&self) -> ReadWriteRatio {
        self.read_write_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_style_accumulates() {
        let annotation = ResourceAnnotation::new()
            .on_numa_node(1)
            .with_isolation(IsolationLevel::Exclusive)
            .with_protocol(Protocol::Batched)
            .with_access_frequency(AccessFrequency::High)
            .with_read_write_ratio(ReadWriteRatio::MostlyWrite);

        assert_eq!(annotation.placement(), PlacementHint::NumaNode(1));
        assert_eq!(annotation.isolation_level(), IsolationLevel::Exclusive);
        assert_eq!(annotation.preferred_protocol(), Protocol::Batched);
        assert_eq!(annotation.access_frequency(), AccessFrequency::High);
        assert_eq!(annotation.read_write_ratio(), ReadWriteRatio::MostlyWrite);
    }

    #[test]
    fn test_defaults_are_neutral() {
        let annotation = ResourceAnnotation::new();
        assert_eq!(annotation.placement(), PlacementHint::Any);
        assert_eq!(annotation.isolation_level(), IsolationLevel::None);
        assert_eq!(annotation.preferred_protocol(), Protocol::None);
    }
}
