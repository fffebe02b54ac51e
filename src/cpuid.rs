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

//! CPUID capture and APIC ID topology decoding.
//!
//! A [`CpuId`] is captured once per logical processor while the calling
//! thread is pinned to it, and is immutable afterwards. Everything past the
//! capture is pure arithmetic over the recorded leaves, so the decoding
//! functions are exposed separately for testing against synthetic data.

use serde::Serialize;
use tracing::debug;

use crate::affinity::{GroupAffinity, ThreadAffinity};
use crate::constants::cpu::{CPUID_EXT, MAX_CPUID_LEAVES, MAX_THREADS_PER_GROUP};

/// Raw CPUID register quad: `[eax, ebx, ecx, edx]`.
pub type Leaf = [u32; 4];

const EAX: usize = 0;
const EBX: usize = 1;
const ECX: usize = 2;
const EDX: usize = 3;

/// Executes the CPUID instruction on the current logical processor.
pub trait CpuIdSource {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Leaf;
}

/// CPUID on the processor the calling thread currently runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCpuId;

impl CpuIdSource for NativeCpuId {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[allow(unused_unsafe)]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Leaf {
        #[cfg(target_arch = "x86")]
        use std::arch::x86::__cpuid_count;
        #[cfg(target_arch = "x86_64")]
        use std::arch::x86_64::__cpuid_count;

        // SAFETY: CPUID exists on every processor these targets run on.
        let r = unsafe { __cpuid_count(leaf, subleaf) };
        [r.eax, r.ebx, r.ecx, r.edx]
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    fn cpuid(&self, _leaf: u32, _subleaf: u32) -> Leaf {
        [0; 4]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

impl Vendor {
    /// Map the 12-character leaf 0 signature to a vendor.
    pub fn from_signature(signature: &str) -> Self {
        match signature {
            "GenuineIntel" => Vendor::Intel,
            "AuthenticAMD" => Vendor::Amd,
            _ => Vendor::Unknown,
        }
    }
}

/// Bits of the APIC ID taken by the core and SMT thread fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MaskWidths {
    pub core: u32,
    pub thread: u32,
}

/// Package/core/thread identifiers decoded from an APIC ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ApicTopology {
    pub processor_id: u32,
    pub core_id: u32,
    pub thread_id: u32,
}

/// Number of bits needed to represent `x - 1`; 0 for `x <= 0`.
pub fn ceil_log2(x: i64) -> u32 {
    if x <= 0 {
        return 0;
    }
    64 - ((x - 1) as u64).leading_zeros()
}

/// Intel: SMT bits from logical-per-package / cores-per-package, core bits
/// from cores-per-package.
pub fn intel_mask_widths(max_logical_per_package: u32, max_core_per_package: u32) -> MaskWidths {
    let cores = max_core_per_package.max(1);
    MaskWidths {
        thread: ceil_log2(i64::from(max_logical_per_package / cores)),
        core: ceil_log2(i64::from(cores)),
    }
}

/// Core count implied by the ApicIdCoreIdSize nibble (ext leaf 8 ECX bits
/// 12-15) on family 17h/19h parts; other values keep `core_per_package`.
pub fn amd_zen_core_count(apic_id_size: u32, core_per_package: u32) -> u32 {
    match apic_id_size {
        0x04 => 16,
        0x05 => 32,
        0x06 => 64,
        _ => core_per_package,
    }
}

/// AMD: only core bits; SMT siblings are not split out of the APIC ID here.
pub fn amd_mask_widths(family: u32, ext_leaf8_ecx: Option<u32>) -> MaskWidths {
    let mut core_per_package = ext_leaf8_ecx.map(|ecx| (ecx & 0xFF) + 1).unwrap_or(1);
    if let (0x17 | 0x19, Some(ecx)) = (family, ext_leaf8_ecx) {
        core_per_package = amd_zen_core_count((ecx >> 12) & 0xF, core_per_package);
    }
    MaskWidths {
        core: ceil_log2(i64::from(core_per_package)),
        thread: 0,
    }
}

pub fn decompose_apic_id(apic_id: u32, widths: MaskWidths) -> ApicTopology {
    let MaskWidths { core, thread } = widths;
    let processor_id = apic_id.checked_shr(core + thread).unwrap_or(0);
    let core_id = (apic_id >> thread) - (processor_id << core);
    let thread_id = apic_id - (processor_id << (core + thread)) - (core_id << thread);
    ApicTopology {
        processor_id,
        core_id,
        thread_id,
    }
}

/// Strip marketing noise from a brand string: `(R)`, `(TM)`, `CPU`,
/// `N-Core Processor` and the `@ clock` suffix.
pub fn short_name(brand: &str) -> String {
    let mut s = brand
        .replace("(R)", "")
        .replace("(TM)", "")
        .replace("(tm)", "");
    if let Some(at) = s.rfind('@') {
        s.truncate(at);
    }

    let tokens: Vec<&str> = s.split_whitespace().collect();
    let mut kept: Vec<&str> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        if token == "CPU" {
            i += 1;
            continue;
        }
        if token.ends_with("-Core") && tokens.get(i + 1) == Some(&"Processor") {
            i += 2;
            continue;
        }
        kept.push(token);
        i += 1;
    }
    kept.join(" ")
}

fn registers_to_string(regs: &[u32]) -> String {
    let bytes: Vec<u8> = regs.iter().flat_map(|r| r.to_le_bytes()).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// CPUID snapshot of one logical processor.
#[derive(Debug, Clone, Serialize)]
pub struct CpuId {
    group: u16,
    thread: u32,
    affinity: GroupAffinity,
    vendor: Vendor,
    family: u32,
    model: u32,
    stepping: u32,
    apic_id: u32,
    pkg_type: u32,
    data: Vec<Leaf>,
    ext_data: Vec<Leaf>,
    brand_string: String,
    name: String,
    widths: MaskWidths,
    processor_id: u32,
    core_id: u32,
    thread_id: u32,
}

impl CpuId {
    /// Capture the logical processor `thread` of `group`.
    ///
    /// `None` when the processor does not exist (pinning fails); this is how
    /// enumeration finds the end of a group.
    pub fn get(group: u16, thread: u32) -> Option<CpuId> {
        if thread >= MAX_THREADS_PER_GROUP {
            return None;
        }
        let affinity = GroupAffinity::single(group, thread);
        let guard = match ThreadAffinity::pin(affinity) {
            Ok(Some(guard)) => guard,
            Ok(None) => return None,
            Err(e) => {
                debug!(group, thread, "cannot pin for CPUID: {e}");
                return None;
            }
        };
        let id = Self::capture(&NativeCpuId, group, thread, affinity);
        drop(guard);
        Some(id)
    }

    /// Build a snapshot from `source`, assumed to already run on the target
    /// processor.
    pub fn capture(source: &dyn CpuIdSource, group: u16, thread: u32, affinity: GroupAffinity) -> CpuId {
        let mut id = CpuId {
            group,
            thread,
            affinity,
            vendor: Vendor::Unknown,
            family: 0,
            model: 0,
            stepping: 0,
            apic_id: 0,
            pkg_type: 0,
            data: Vec::new(),
            ext_data: Vec::new(),
            brand_string: String::new(),
            name: String::new(),
            widths: MaskWidths::default(),
            processor_id: 0,
            core_id: 0,
            thread_id: 0,
        };

        let leaf0 = source.cpuid(0, 0);
        if leaf0[EAX] == 0 {
            return id;
        }

        let max_leaf = leaf0[EAX].min(MAX_CPUID_LEAVES);
        id.data = (0..=max_leaf).map(|i| source.cpuid(i, 0)).collect();

        let ext_top = source.cpuid(CPUID_EXT, 0)[EAX];
        let max_ext = if ext_top > CPUID_EXT {
            (ext_top - CPUID_EXT).min(MAX_CPUID_LEAVES)
        } else {
            0
        };
        id.ext_data = (0..=max_ext).map(|i| source.cpuid(CPUID_EXT + i, 0)).collect();

        id.vendor = Vendor::from_signature(&registers_to_string(&[
            leaf0[EBX], leaf0[EDX], leaf0[ECX],
        ]));

        if id.ext_data.len() > 4 {
            let regs: Vec<u32> = id.ext_data[2..=4].iter().flatten().copied().collect();
            id.brand_string = registers_to_string(&regs).replace('\0', " ").trim().to_string();
            id.name = short_name(&id.brand_string);
        }

        if let Some(leaf1) = id.data.get(1).copied() {
            let eax = leaf1[EAX];
            id.family = ((eax >> 20) & 0xFF) + ((eax >> 8) & 0xF);
            id.model = ((eax >> 12) & 0xF0) + ((eax >> 4) & 0xF);
            id.stepping = eax & 0xF;
            id.apic_id = (leaf1[EBX] >> 24) & 0xFF;
        }

        id.widths = match id.vendor {
            Vendor::Intel => {
                let max_logical = id.data.get(1).map(|l| (l[EBX] >> 16) & 0xFF).unwrap_or(1);
                let max_core = id.data.get(4).map(|l| ((l[EAX] >> 26) & 0x3F) + 1).unwrap_or(1);
                intel_mask_widths(max_logical, max_core)
            }
            Vendor::Amd => {
                id.pkg_type = id.ext_data.get(1).map(|l| (l[EBX] >> 28) & 0xFF).unwrap_or(0);
                amd_mask_widths(id.family, id.ext_data.get(8).map(|l| l[ECX]))
            }
            Vendor::Unknown => MaskWidths::default(),
        };

        let topo = decompose_apic_id(id.apic_id, id.widths);
        id.processor_id = topo.processor_id;
        id.core_id = topo.core_id;
        id.thread_id = topo.thread_id;
        id
    }

    pub fn group(&self) -> u16 {
        self.group
    }

    /// Index of the logical processor within its group.
    pub fn thread(&self) -> u32 {
        self.thread
    }

    /// Affinity used to capture this snapshot; pin to it for per-core access.
    pub fn affinity(&self) -> GroupAffinity {
        self.affinity
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn model(&self) -> u32 {
        self.model
    }

    pub fn stepping(&self) -> u32 {
        self.stepping
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    pub fn pkg_type(&self) -> u32 {
        self.pkg_type
    }

    /// Standard leaves `0..=max`, indexed by leaf number.
    pub fn data(&self) -> &[Leaf] {
        &self.data
    }

    /// Extended leaves, indexed by `leaf - 0x8000_0000`.
    pub fn ext_data(&self) -> &[Leaf] {
        &self.ext_data
    }

    pub fn leaf(&self, index: u32) -> Option<Leaf> {
        self.data.get(index as usize).copied()
    }

    pub fn ext_leaf(&self, index: u32) -> Option<Leaf> {
        self.ext_data.get(index as usize).copied()
    }

    pub fn brand_string(&self) -> &str {
        &self.brand_string
    }

    /// Brand string without trademarks, core-count suffix or clock.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mask_widths(&self) -> MaskWidths {
        self.widths
    }

    pub fn processor_id(&self) -> u32 {
        self.processor_id
    }

    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    /// Synthetic CPUID: unknown leaves read as zero.
    #[derive(Default)]
    pub(crate) struct RegisterTable {
        leaves: HashMap<u32, Leaf>,
    }

    impl RegisterTable {
        pub(crate) fn set(mut self, leaf: u32, regs: Leaf) -> Self {
            self.leaves.insert(leaf, regs);
            self
        }

        pub(crate) fn vendor(self, max_leaf: u32, signature: &[u8; 12]) -> Self {
            let word = |i: usize| u32::from_le_bytes([
                signature[i],
                signature[i + 1],
                signature[i + 2],
                signature[i + 3],
            ]);
            // EBX, EDX, ECX order
            self.set(0, [max_leaf, word(0), word(8), word(4)])
        }

        pub(crate) fn brand(mut self, brand: &str) -> Self {
            let mut bytes = [0u8; 48];
            bytes[..brand.len()].copy_from_slice(brand.as_bytes());
            for (n, chunk) in bytes.chunks(16).enumerate() {
                let mut regs = [0u32; 4];
                for (r, word) in chunk.chunks(4).enumerate() {
                    regs[r] = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                }
                self.leaves.insert(CPUID_EXT + 2 + n as u32, regs);
            }
            self
        }
    }

    impl CpuIdSource for RegisterTable {
        fn cpuid(&self, leaf: u32, _subleaf: u32) -> Leaf {
            self.leaves.get(&leaf).copied().unwrap_or([0; 4])
        }
    }

    /// Intel part with `logical` logical and `cores` cores per package.
    pub(crate) fn intel_table(apic_id: u32, logical: u32, cores: u32) -> RegisterTable {
        RegisterTable::default()
            .vendor(0x16, b"GenuineIntel")
            // family 6, model 0x9E, stepping 10
            .set(1, [0x000906EA, (apic_id << 24) | (logical << 16), 0, 0])
            .set(4, [(cores - 1) << 26, 0, 0, 0])
            .set(CPUID_EXT, [CPUID_EXT + 8, 0, 0, 0])
            .brand("Intel(R) Core(TM) i7-8700K CPU @ 3.70GHz")
    }

    /// AMD family 19h part with the given ext leaf 8 ECX.
    pub(crate) fn amd_table(apic_id: u32, ext8_ecx: u32) -> RegisterTable {
        RegisterTable::default()
            .vendor(0x10, b"AuthenticAMD")
            // base family 0xF + ext family 0xA = 0x19, model 0x21
            .set(1, [0x00A20F10, apic_id << 24, 0, 0])
            .set(CPUID_EXT, [CPUID_EXT + 0x20, 0, 0, 0])
            .set(CPUID_EXT + 1, [0, 0x2 << 28, 0, 0])
            .set(CPUID_EXT + 8, [0, 0, ext8_ecx, 0])
            .brand("AMD Ryzen 9 5950X 16-Core Processor            ")
    }

    fn capture(table: &RegisterTable) -> CpuId {
        CpuId::capture(table, 0, 0, GroupAffinity::single(0, 0))
    }

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(64), 6);
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(-7), 0);
        assert_eq!(ceil_log2(i64::MAX), 63);
    }

    #[test]
    fn test_apic_round_trip() {
        let widths = MaskWidths { core: 2, thread: 1 };
        for apic_id in 0..=255u32 {
            let t = decompose_apic_id(apic_id, widths);
            assert!(t.thread_id < 2);
            assert!(t.core_id < 4);
            let rebuilt = (t.processor_id << 3) + (t.core_id << 1) + t.thread_id;
            assert_eq!(rebuilt, apic_id);
        }
    }

    #[test]
    fn test_apic_zero_widths() {
        let t = decompose_apic_id(13, MaskWidths::default());
        assert_eq!(t, ApicTopology { processor_id: 13, core_id: 0, thread_id: 0 });
    }

    #[test]
    fn test_amd_zen_lookup() {
        assert_eq!(amd_zen_core_count(0x04, 8), 16);
        assert_eq!(amd_zen_core_count(0x05, 8), 32);
        assert_eq!(amd_zen_core_count(0x06, 8), 64);
        assert_eq!(amd_zen_core_count(0x03, 8), 8);
        assert_eq!(amd_zen_core_count(0x07, 12), 12);
    }

    #[test]
    fn test_amd_widths_only_override_zen_families() {
        let ecx = (0x5 << 12) | 7; // 8 cores, ApicIdCoreIdSize 5
        assert_eq!(amd_mask_widths(0x19, Some(ecx)), MaskWidths { core: 5, thread: 0 });
        assert_eq!(amd_mask_widths(0x17, Some(ecx)), MaskWidths { core: 5, thread: 0 });
        assert_eq!(amd_mask_widths(0x15, Some(ecx)), MaskWidths { core: 3, thread: 0 });
        assert_eq!(amd_mask_widths(0x19, None), MaskWidths { core: 0, thread: 0 });
    }

    #[test]
    fn test_intel_widths() {
        assert_eq!(intel_mask_widths(8, 4), MaskWidths { core: 2, thread: 1 });
        assert_eq!(intel_mask_widths(16, 8), MaskWidths { core: 3, thread: 1 });
        assert_eq!(intel_mask_widths(1, 1), MaskWidths { core: 0, thread: 0 });
        assert_eq!(intel_mask_widths(0, 0), MaskWidths { core: 0, thread: 0 });
    }

    #[test]
    fn test_intel_capture() {
        let id = capture(&intel_table(0x05, 8, 4));
        assert_eq!(id.vendor(), Vendor::Intel);
        assert_eq!(id.family(), 6);
        assert_eq!(id.model(), 0x9E);
        assert_eq!(id.stepping(), 0xA);
        assert_eq!(id.apic_id(), 5);
        assert_eq!(id.mask_widths(), MaskWidths { core: 2, thread: 1 });
        assert_eq!(id.processor_id(), 0);
        assert_eq!(id.core_id(), 2);
        assert_eq!(id.thread_id(), 1);
        assert_eq!(id.data().len(), 0x17);
        assert_eq!(id.ext_data().len(), 9);
        assert_eq!(id.brand_string(), "Intel(R) Core(TM) i7-8700K CPU @ 3.70GHz");
        assert_eq!(id.name(), "Intel Core i7-8700K");
        assert_eq!(id.pkg_type(), 0);
    }

    #[test]
    fn test_intel_without_leaf4_defaults_to_one_core() {
        let table = RegisterTable::default()
            .vendor(1, b"GenuineIntel")
            .set(1, [0x000006F6, (3 << 24) | (2 << 16), 0, 0]);
        let id = capture(&table);
        assert_eq!(id.mask_widths(), MaskWidths { core: 0, thread: 1 });
        assert_eq!(id.processor_id(), 1);
        assert_eq!(id.thread_id(), 1);
    }

    #[test]
    fn test_amd_capture() {
        // 16 cores, ApicIdCoreIdSize 4 -> 4 core bits
        let id = capture(&amd_table(0x13, (0x4 << 12) | 15));
        assert_eq!(id.vendor(), Vendor::Amd);
        assert_eq!(id.family(), 0x19);
        assert_eq!(id.model(), 0x21);
        assert_eq!(id.mask_widths(), MaskWidths { core: 4, thread: 0 });
        assert_eq!(id.processor_id(), 1);
        assert_eq!(id.core_id(), 3);
        assert_eq!(id.thread_id(), 0);
        assert_eq!(id.pkg_type(), 2);
        assert_eq!(id.name(), "AMD Ryzen 9 5950X");
    }

    #[test]
    fn test_unknown_vendor_has_no_widths() {
        let table = RegisterTable::default()
            .vendor(1, b"HygonGenuine")
            .set(1, [0, 9 << 24, 0, 0]);
        let id = capture(&table);
        assert_eq!(id.vendor(), Vendor::Unknown);
        assert_eq!(id.mask_widths(), MaskWidths::default());
        assert_eq!(id.processor_id(), 9);
    }

    #[test]
    fn test_zero_basic_leaves_leaves_defaults() {
        let id = capture(&RegisterTable::default());
        assert_eq!(id.vendor(), Vendor::Unknown);
        assert!(id.data().is_empty());
        assert!(id.ext_data().is_empty());
        assert_eq!(id.brand_string(), "");
        assert_eq!(id.affinity(), GroupAffinity::single(0, 0));
    }

    #[test]
    fn test_leaf_table_is_capped() {
        let table = RegisterTable::default()
            .vendor(0xFFFF, b"GenuineIntel")
            .set(CPUID_EXT, [0xFFFF_FFFF, 0, 0, 0]);
        let id = capture(&table);
        assert_eq!(id.data().len(), MAX_CPUID_LEAVES as usize + 1);
        assert_eq!(id.ext_data().len(), MAX_CPUID_LEAVES as usize + 1);
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("Intel(R) Xeon(R) CPU E5-2690 v4 @ 2.60GHz"), "Intel Xeon E5-2690 v4");
        assert_eq!(short_name("AMD Ryzen 7 1700 Eight-Core Processor"), "AMD Ryzen 7 1700");
        assert_eq!(short_name("AMD Ryzen Threadripper 3990X 64-Core Processor"), "AMD Ryzen Threadripper 3990X");
        assert_eq!(short_name("Intel(R) Core(TM)2 Duo CPU     T7500  @ 2.20GHz"), "Intel Core2 Duo T7500");
        assert_eq!(short_name(""), "");
    }

    #[test]
    fn test_vendor_from_signature() {
        assert_eq!(Vendor::from_signature("GenuineIntel"), Vendor::Intel);
        assert_eq!(Vendor::from_signature("AuthenticAMD"), Vendor::Amd);
        assert_eq!(Vendor::from_signature("CentaurHauls"), Vendor::Unknown);
    }

    #[test]
    fn test_get_rejects_thread_beyond_limit() {
        assert!(CpuId::get(0, MAX_THREADS_PER_GROUP).is_none());
        assert!(CpuId::get(0, 1000).is_none());
    }
}
