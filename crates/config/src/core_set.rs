// SPDX-License-Identifier: Apache-2.0

//! Ordered sets of logical CPUs the engine occupies.
//!
//! A [`CoreSet`] fixes, at start time, which logical CPU each worker is
//! pinned to and which NUMA node that CPU belongs to. Worker ids are simply
//! indices into the set, so the order of the set *is* the worker numbering.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// One logical CPU together with the NUMA node it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreDescriptor {
    /// Logical CPU id as the OS numbers them.
    pub cpu_id: u16,
    /// NUMA node the CPU belongs to.
    pub numa_node_id: u8,
}

/// Order in which the cores of a set are assigned to worker ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoreOrder {
    /// Keep the order the cores were listed in.
    #[default]
    Listed,
    /// Group cores by NUMA node, ascending CPU id within a node. Workers
    /// with adjacent ids then share a node, which keeps stealing local.
    NumaGrouped,
}

/// The ordered set of logical CPUs the engine occupies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSet {
    cores: SmallVec<[CoreDescriptor; 16]>,
}

impl CoreSet {
    /// Builds a core set from `(cpu_id, numa_node_id)` pairs, in the order
    /// given.
    #[must_use]
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u16, u8)>,
    {
        Self {
            cores: pairs
                .into_iter()
                .map(|(cpu_id, numa_node_id)| CoreDescriptor {
                    cpu_id,
                    numa_node_id,
                })
                .collect(),
        }
    }

    /// Detects the first `count` logical CPUs of this machine together with
    /// their NUMA nodes.
    pub fn detect(count: usize) -> Result<Self, Error> {
        let available = core_affinity::get_core_ids().ok_or(Error::CoreDetectionUnavailable)?;
        let cores = available
            .iter()
            .take(count)
            .map(|core| CoreDescriptor {
                cpu_id: core.id as u16,
                numa_node_id: numa_node_of_cpu(core.id),
            })
            .collect();
        let set = Self { cores };
        if set.is_empty() {
            return Err(Error::EmptyCoreSet);
        }
        Ok(set)
    }

    /// Checks that every CPU in the set exists on this machine.
    pub fn check_against_machine(&self) -> Result<(), Error> {
        let available = core_affinity::get_core_ids().ok_or(Error::CoreDetectionUnavailable)?;
        for descriptor in self.iter() {
            if !available
                .iter()
                .any(|core| core.id == usize::from(descriptor.cpu_id))
            {
                return Err(Error::UnknownCpu {
                    cpu_id: descriptor.cpu_id,
                    available: available.iter().map(|core| core.id).collect(),
                });
            }
        }
        Ok(())
    }

    /// Re-orders the set according to `order` and returns it.
    #[must_use]
    pub fn ordered(mut self, order: CoreOrder) -> Self {
        match order {
            CoreOrder::Listed => {}
            CoreOrder::NumaGrouped => self
                .cores
                .sort_by_key(|descriptor| (descriptor.numa_node_id, descriptor.cpu_id)),
        }
        self
    }

    /// Number of cores (= workers) in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    /// True when the set holds no cores.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// The descriptor assigned to the given worker id.
    #[must_use]
    pub fn get(&self, worker_id: usize) -> Option<CoreDescriptor> {
        self.cores.get(worker_id).copied()
    }

    /// The NUMA node of the given worker id.
    ///
    /// # Panics
    /// Panics when `worker_id` is not part of the set.
    #[must_use]
    pub fn numa_node_of(&self, worker_id: usize) -> u8 {
        self.cores[worker_id].numa_node_id
    }

    /// Number of distinct NUMA nodes in the set, counted as
    /// `max(node id) + 1` so node ids can index dense arrays.
    #[must_use]
    pub fn numa_node_count(&self) -> usize {
        self.cores
            .iter()
            .map(|descriptor| usize::from(descriptor.numa_node_id) + 1)
            .max()
            .unwrap_or(1)
    }

    /// Worker ids that live on the given NUMA node.
    pub fn workers_on_node(&self, numa_node_id: u8) -> impl Iterator<Item = usize> + '_ {
        self.cores
            .iter()
            .enumerate()
            .filter(move |(_, descriptor)| descriptor.numa_node_id == numa_node_id)
            .map(|(worker_id, _)| worker_id)
    }

    /// Iterates over the descriptors in worker-id order.
    pub fn iter(&self) -> impl Iterator<Item = &CoreDescriptor> {
        self.cores.iter()
    }
}

/// Looks up the NUMA node of a logical CPU via sysfs. Falls back to node 0
/// on platforms without that topology information.
#[must_use]
pub fn numa_node_of_cpu(cpu_id: usize) -> u8 {
    #[cfg(target_os = "linux")]
    {
        let path = format!("/sys/devices/system/cpu/cpu{cpu_id}");
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if let Some(rest) = name.to_string_lossy().strip_prefix("node") {
                    if let Ok(node) = rest.parse::<u8>() {
                        return node;
                    }
                }
            }
        }
        0
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cpu_id;
        0
    }
}
