/*
 * This file is part of Hwprobe.
 *
 * Copyright (C) 2025 Hwprobe contributors
 *
 * Hwprobe is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Hwprobe is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Hwprobe. If not, see <https://www.gnu.org/licenses/>.
 */

//! Processor enumeration across groups and grouping into packages and cores.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::affinity::ThreadAffinity;
use crate::constants::cpu::MAX_THREADS_PER_GROUP;
use crate::cpuid::CpuId;

/// Logical processors arranged as `packages[processor][core][thread]`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuTopology {
    packages: Vec<Vec<Vec<CpuId>>>,
}

impl CpuTopology {
    /// Group threads by `processor_id`, then by `core_id`, both ascending.
    /// Threads keep their enumeration order within a core.
    pub fn from_threads(threads: Vec<CpuId>) -> Self {
        let mut by_package: BTreeMap<u32, BTreeMap<u32, Vec<CpuId>>> = BTreeMap::new();
        for thread in threads {
            by_package
                .entry(thread.processor_id())
                .or_default()
                .entry(thread.core_id())
                .or_default()
                .push(thread);
        }
        let packages = by_package
            .into_values()
            .map(|cores| cores.into_values().collect())
            .collect();
        Self { packages }
    }

    pub fn packages(&self) -> &[Vec<Vec<CpuId>>] {
        &self.packages
    }

    pub fn into_packages(self) -> Vec<Vec<Vec<CpuId>>> {
        self.packages
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn core_count(&self) -> usize {
        self.packages.iter().map(Vec::len).sum()
    }

    pub fn thread_count(&self) -> usize {
        self.threads().count()
    }

    pub fn threads(&self) -> impl Iterator<Item = &CpuId> {
        self.packages.iter().flatten().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Probe every logical processor of every processor group.
pub fn discover_threads() -> Vec<CpuId> {
    discover_threads_with(ThreadAffinity::processor_group_count(), CpuId::get)
}

pub(crate) fn discover_threads_with<F>(groups: u16, mut probe: F) -> Vec<CpuId>
where
    F: FnMut(u16, u32) -> Option<CpuId>,
{
    let mut threads = Vec::new();
    for group in 0..groups {
        let before = threads.len();
        for thread in 0..MAX_THREADS_PER_GROUP {
            if let Some(id) = probe(group, thread) {
                threads.push(id);
            }
        }
        debug!(group, found = threads.len() - before, "processor group probed");
    }
    threads
}

/// Discover and group all logical processors.
pub fn discover() -> CpuTopology {
    let topology = CpuTopology::from_threads(discover_threads());
    info!(
        packages = topology.package_count(),
        cores = topology.core_count(),
        threads = topology.thread_count(),
        "CPU topology discovered"
    );
    topology
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::GroupAffinity;
    use crate::cpuid::tests::intel_table;

    fn intel_thread(apic_id: u32, index: u32) -> CpuId {
        // 2 threads per core, 4 cores per package
        CpuId::capture(&intel_table(apic_id, 8, 4), 0, index, GroupAffinity::single(0, index))
    }

    #[test]
    fn test_grouping_two_packages() {
        // APIC ids: package bits start at bit 3
        let apics = [0x9, 0x0, 0x8, 0x1, 0x2, 0x3, 0xA, 0xB];
        let threads: Vec<CpuId> = apics
            .iter()
            .enumerate()
            .map(|(i, &apic)| intel_thread(apic, i as u32))
            .collect();

        let topo = CpuTopology::from_threads(threads);
        assert_eq!(topo.package_count(), 2);
        assert_eq!(topo.core_count(), 4);
        assert_eq!(topo.thread_count(), 8);

        for (p, package) in topo.packages().iter().enumerate() {
            for (c, core) in package.iter().enumerate() {
                assert_eq!(core.len(), 2);
                for t in core {
                    assert_eq!(t.processor_id() as usize, p);
                    assert_eq!(t.core_id() as usize, c);
                }
            }
        }

        // enumeration order kept inside a core: apic 0x9 came before 0x8
        let first_core_pkg1: Vec<u32> = topo.packages()[1][0].iter().map(|t| t.apic_id()).collect();
        assert_eq!(first_core_pkg1, vec![0x9, 0x8]);
    }

    #[test]
    fn test_empty_topology() {
        let topo = CpuTopology::from_threads(Vec::new());
        assert!(topo.is_empty());
        assert_eq!(topo.thread_count(), 0);
    }

    #[test]
    fn test_discovery_probes_each_group_up_to_limit() {
        let mut calls = Vec::new();
        let threads = discover_threads_with(2, |group, thread| {
            calls.push((group, thread));
            (thread < 3).then(|| intel_thread(thread, thread))
        });
        assert_eq!(calls.len(), 2 * MAX_THREADS_PER_GROUP as usize);
        assert_eq!(threads.len(), 6);
    }
}
