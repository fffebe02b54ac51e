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

//! Processor-group affinity for the calling thread.
//!
//! Per-core register access (MSRs, CPUID) only means something when the
//! calling thread runs on the core being asked about, so callers pin the
//! thread with [`ThreadAffinity::set`] or the scoped [`ThreadAffinity::pin`]
//! and restore the previous affinity straight afterwards.

use std::fmt;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::cpu::UNDEFINED_GROUP;
use crate::error::{ProbeError, Result};

/// A processor group plus a bitmask of logical processors within it.
///
/// Bit `i` of `mask` denotes logical processor `i` of `group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupAffinity {
    group: u16,
    mask: u64,
}

impl GroupAffinity {
    /// Sentinel meaning "no affinity change happened / not supported".
    pub const UNDEFINED: GroupAffinity = GroupAffinity {
        group: UNDEFINED_GROUP,
        mask: 0,
    };

    pub const fn new(group: u16, mask: u64) -> Self {
        Self { group, mask }
    }

    /// Affinity selecting exactly logical processor `index` of `group`.
    ///
    /// `index` must be below 64; anything else is a caller bug.
    pub fn single(group: u16, index: u32) -> Self {
        assert!(index < 64, "logical processor index {index} exceeds group width");
        Self::new(group, 1u64 << index)
    }

    pub const fn group(&self) -> u16 {
        self.group
    }

    pub const fn mask(&self) -> u64 {
        self.mask
    }

    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }

    pub fn contains(&self, index: u32) -> bool {
        index < 64 && self.mask & (1u64 << index) != 0
    }

    /// Lowest logical processor selected by the mask.
    pub fn first_index(&self) -> Option<u32> {
        if self.mask == 0 {
            None
        } else {
            Some(self.mask.trailing_zeros())
        }
    }
}

impl fmt::Display for GroupAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "undefined")
        } else {
            write!(f, "group {} mask {:#018x}", self.group, self.mask)
        }
    }
}

/// OS primitive behind [`ThreadAffinity`].
#[cfg_attr(test, mockall::automock)]
pub trait AffinityApi: Send + Sync {
    /// Number of processor groups the OS exposes.
    fn processor_group_count(&self) -> u16;

    /// Affinity of the calling thread, `None` if it cannot be queried.
    fn current(&self) -> Option<GroupAffinity>;

    /// Apply `affinity` to the calling thread and return what it replaced.
    ///
    /// `Ok(None)` means the OS refused the change.
    fn swap(&self, affinity: GroupAffinity) -> Result<Option<GroupAffinity>>;
}

/// The build target's affinity primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsAffinity;

static OS_AFFINITY: OsAffinity = OsAffinity;

lazy_static! {
    static ref PROCESSOR_GROUP_COUNT: u16 = OS_AFFINITY.processor_group_count().max(1);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod platform {
    use std::mem;

    use super::*;

    fn read_mask() -> Option<u64> {
        // SAFETY: cpu_set_t is plain data; all-zero is the empty set.
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        // SAFETY: `set` is valid for writes of the size we pass.
        let rc = unsafe { libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) };
        if rc != 0 {
            return None;
        }
        let mut mask = 0u64;
        for cpu in 0..64usize {
            // SAFETY: cpu is within the bounds of cpu_set_t.
            if unsafe { libc::CPU_ISSET(cpu, &set) } {
                mask |= 1u64 << cpu;
            }
        }
        Some(mask)
    }

    fn write_mask(mask: u64) -> bool {
        // SAFETY: see read_mask.
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        for cpu in 0..64usize {
            if mask & (1u64 << cpu) != 0 {
                // SAFETY: cpu is within the bounds of cpu_set_t.
                unsafe { libc::CPU_SET(cpu, &mut set) };
            }
        }
        // SAFETY: `set` outlives the call and matches the size we pass.
        unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) == 0 }
    }

    impl AffinityApi for OsAffinity {
        fn processor_group_count(&self) -> u16 {
            1
        }

        fn current(&self) -> Option<GroupAffinity> {
            read_mask().map(|mask| GroupAffinity::new(0, mask))
        }

        fn swap(&self, affinity: GroupAffinity) -> Result<Option<GroupAffinity>> {
            if affinity.group() > 0 {
                return Err(ProbeError::AffinityOutOfRange {
                    group: affinity.group(),
                    groups: 1,
                });
            }
            let Some(previous) = read_mask() else {
                return Ok(None);
            };
            if !write_mask(affinity.mask()) {
                return Ok(None);
            }
            Ok(Some(GroupAffinity::new(0, previous)))
        }
    }
}

#[cfg(windows)]
mod platform {
    use windows::Win32::System::SystemInformation::GROUP_AFFINITY;
    use windows::Win32::System::Threading::{
        GetActiveProcessorGroupCount, GetCurrentThread, GetThreadGroupAffinity,
        SetThreadGroupAffinity,
    };

    use super::*;

    fn to_native(affinity: GroupAffinity) -> GROUP_AFFINITY {
        GROUP_AFFINITY {
            Mask: affinity.mask() as usize,
            Group: affinity.group(),
            Reserved: [0; 3],
        }
    }

    fn from_native(native: &GROUP_AFFINITY) -> GroupAffinity {
        GroupAffinity::new(native.Group, native.Mask as u64)
    }

    impl AffinityApi for OsAffinity {
        fn processor_group_count(&self) -> u16 {
            // SAFETY: no arguments, no preconditions.
            unsafe { GetActiveProcessorGroupCount() }
        }

        fn current(&self) -> Option<GroupAffinity> {
            let mut native = GROUP_AFFINITY::default();
            // SAFETY: pseudo handle for the current thread; `native` is writable.
            let ok = unsafe { GetThreadGroupAffinity(GetCurrentThread(), &mut native) };
            ok.as_bool().then(|| from_native(&native))
        }

        fn swap(&self, affinity: GroupAffinity) -> Result<Option<GroupAffinity>> {
            let groups = ThreadAffinity::processor_group_count();
            if affinity.group() >= groups {
                return Err(ProbeError::AffinityOutOfRange {
                    group: affinity.group(),
                    groups,
                });
            }
            let requested = to_native(affinity);
            let mut previous = GROUP_AFFINITY::default();
            // SAFETY: both structures live on this stack frame for the duration of the call.
            let ok = unsafe {
                SetThreadGroupAffinity(GetCurrentThread(), &requested, Some(&mut previous as *mut _))
            };
            if !ok.as_bool() {
                return Ok(None);
            }
            Ok(Some(from_native(&previous)))
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
mod platform {
    use super::*;

    impl AffinityApi for OsAffinity {
        fn processor_group_count(&self) -> u16 {
            1
        }

        fn current(&self) -> Option<GroupAffinity> {
            None
        }

        fn swap(&self, affinity: GroupAffinity) -> Result<Option<GroupAffinity>> {
            if affinity.group() > 0 {
                return Err(ProbeError::AffinityOutOfRange {
                    group: affinity.group(),
                    groups: 1,
                });
            }
            Ok(None)
        }
    }
}

/// Applies and reverts [`GroupAffinity`] values on the calling thread.
pub struct ThreadAffinity;

impl ThreadAffinity {
    /// Processor groups on this machine, computed once. Always at least 1.
    pub fn processor_group_count() -> u16 {
        *PROCESSOR_GROUP_COUNT
    }

    /// Affinity of the calling thread, or `UNDEFINED` if it cannot be read.
    pub fn current() -> GroupAffinity {
        OS_AFFINITY.current().unwrap_or(GroupAffinity::UNDEFINED)
    }

    /// Swap the calling thread's affinity and return the previous one.
    ///
    /// `UNDEFINED` is a no-op that returns `UNDEFINED`. If the OS refuses the
    /// change the result is also `UNDEFINED`. A group the platform cannot
    /// address is rejected with [`ProbeError::AffinityOutOfRange`].
    pub fn set(affinity: GroupAffinity) -> Result<GroupAffinity> {
        Self::set_with(&OS_AFFINITY, affinity)
    }

    pub fn set_with(api: &dyn AffinityApi, affinity: GroupAffinity) -> Result<GroupAffinity> {
        if affinity.is_undefined() {
            return Ok(GroupAffinity::UNDEFINED);
        }
        match api.swap(affinity)? {
            Some(previous) => Ok(previous),
            None => {
                debug!(%affinity, "thread affinity change refused");
                Ok(GroupAffinity::UNDEFINED)
            }
        }
    }

    /// Pin the calling thread until the returned guard drops.
    ///
    /// `Ok(None)` means the thread could not be moved (the logical processor
    /// does not exist or the OS refused); nothing needs restoring then.
    pub fn pin(affinity: GroupAffinity) -> Result<Option<AffinityGuard<'static>>> {
        Self::pin_with(&OS_AFFINITY, affinity)
    }

    pub fn pin_with<'a>(
        api: &'a dyn AffinityApi,
        affinity: GroupAffinity,
    ) -> Result<Option<AffinityGuard<'a>>> {
        let previous = Self::set_with(api, affinity)?;
        if previous.is_undefined() {
            return Ok(None);
        }
        Ok(Some(AffinityGuard { api, previous }))
    }
}

/// Restores the thread's previous affinity when dropped.
///
/// Keep the span short: nothing between pin and drop may assume default
/// affinity.
#[must_use = "dropping the guard immediately restores the previous affinity"]
pub struct AffinityGuard<'a> {
    api: &'a dyn AffinityApi,
    previous: GroupAffinity,
}

impl AffinityGuard<'_> {
    /// The affinity that will be restored.
    pub fn previous(&self) -> GroupAffinity {
        self.previous
    }
}

impl Drop for AffinityGuard<'_> {
    fn drop(&mut self) {
        match self.api.swap(self.previous) {
            Ok(Some(_)) => {}
            Ok(None) => warn!(previous = %self.previous, "failed to restore thread affinity"),
            Err(e) => warn!(previous = %self.previous, "failed to restore thread affinity: {e}"),
        }
    }
}
