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

//! Per-thread and aggregate CPU utilisation from successive idle/total
//! time snapshots.
//!
//! The owning hardware object calls [`CpuLoad::update`] on its own polling
//! interval; loads are percentages of the time since the previous accepted
//! snapshot.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::constants::load::{PROC_STAT, STAT_COLUMNS, STAT_IDLE_COLUMN, UNIX_NOISE_FLOOR};

/// Cumulative idle and total time per logical processor, in the source's
/// native units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: Vec<u64>,
    pub total: Vec<u64>,
}

impl CpuTimes {
    pub fn len(&self) -> usize {
        self.idle.len().min(self.total.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// OS counter source behind [`CpuLoad`].
#[cfg_attr(test, mockall::automock)]
pub trait CpuTimesSource: Send {
    /// A fresh snapshot, `None` if the OS call failed.
    fn sample(&mut self) -> Option<CpuTimes>;

    /// Smallest total-time delta worth computing a load from.
    fn noise_floor(&self) -> u64;
}

/// `/proc/stat` reader.
#[derive(Debug, Clone)]
pub struct ProcStat {
    path: PathBuf,
}

impl Default for ProcStat {
    fn default() -> Self {
        Self::new(PROC_STAT)
    }
}

impl ProcStat {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CpuTimesSource for ProcStat {
    fn sample(&mut self) -> Option<CpuTimes> {
        match fs::read_to_string(&self.path) {
            Ok(text) => parse_proc_stat(&text),
            Err(e) => {
                debug!(path = %self.path.display(), "cannot read cpu times: {e}");
                None
            }
        }
    }

    fn noise_floor(&self) -> u64 {
        UNIX_NOISE_FLOOR
    }
}

/// Extract per-thread times from `/proc/stat` text. The aggregate `cpu` line
/// is skipped; each `cpuN` line gives idle (4th counter) and total (sum of
/// the first ten counters).
pub fn parse_proc_stat(text: &str) -> Option<CpuTimes> {
    let mut times = CpuTimes::default();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else { continue };
        let is_thread = label
            .strip_prefix("cpu")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        if !is_thread {
            continue;
        }
        let counters: Vec<u64> = fields
            .take(STAT_COLUMNS)
            .map_while(|f| f.parse().ok())
            .collect();
        if counters.len() < STAT_IDLE_COLUMN {
            continue;
        }
        times.idle.push(counters[STAT_IDLE_COLUMN - 1]);
        times.total.push(counters.iter().sum());
    }
    (!times.is_empty()).then_some(times)
}

#[cfg(windows)]
mod nt {
    use std::ffi::c_void;
    use std::mem::size_of;

    use windows::Wdk::System::SystemInformation::{NtQuerySystemInformation, SYSTEM_INFORMATION_CLASS};

    use super::{CpuTimes, CpuTimesSource};
    use crate::constants::load::WINDOWS_NOISE_FLOOR;

    const SYSTEM_PROCESSOR_PERFORMANCE_INFORMATION: SYSTEM_INFORMATION_CLASS = SYSTEM_INFORMATION_CLASS(8);
    const SYSTEM_PROCESSOR_IDLE_INFORMATION: SYSTEM_INFORMATION_CLASS = SYSTEM_INFORMATION_CLASS(42);

    // Enough for any single processor group and then some.
    const MAX_PROCESSORS: usize = 256;

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct ProcessorPerformance {
        idle_time: i64,
        kernel_time: i64,
        user_time: i64,
        dpc_time: i64,
        interrupt_time: i64,
        interrupt_count: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct ProcessorIdle {
        idle_time: u64,
        c1_time: u64,
        c2_time: u64,
        c3_time: u64,
        c1_transitions: u32,
        c2_transitions: u32,
        c3_transitions: u32,
        padding: u32,
    }

    fn query<T: Copy + Default>(class: SYSTEM_INFORMATION_CLASS) -> Option<Vec<T>> {
        let mut buf = vec![T::default(); MAX_PROCESSORS];
        let mut returned = 0u32;
        // SAFETY: buf is valid for writes of the length we pass.
        let status = unsafe {
            NtQuerySystemInformation(
                class,
                buf.as_mut_ptr().cast::<c_void>(),
                (buf.len() * size_of::<T>()) as u32,
                &mut returned,
            )
        };
        if status.is_err() {
            return None;
        }
        buf.truncate(returned as usize / size_of::<T>());
        Some(buf)
    }

    /// Kernel time reported by the NT kernel already includes idle time.
    #[derive(Debug, Default)]
    pub struct NtCpuTimes;

    impl CpuTimesSource for NtCpuTimes {
        fn sample(&mut self) -> Option<CpuTimes> {
            let idle: Vec<ProcessorIdle> = query(SYSTEM_PROCESSOR_IDLE_INFORMATION)?;
            let perf: Vec<ProcessorPerformance> = query(SYSTEM_PROCESSOR_PERFORMANCE_INFORMATION)?;
            let n = idle.len().min(perf.len());
            if n == 0 {
                return None;
            }
            Some(CpuTimes {
                idle: idle[..n].iter().map(|p| p.idle_time).collect(),
                total: perf[..n]
                    .iter()
                    .map(|p| (p.kernel_time.max(0) + p.user_time.max(0)) as u64)
                    .collect(),
            })
        }

        fn noise_floor(&self) -> u64 {
            WINDOWS_NOISE_FLOOR
        }
    }
}

#[cfg(windows)]
pub use self::nt::NtCpuTimes;

/// The build target's counter source, if it has one.
pub fn platform_source() -> Option<Box<dyn CpuTimesSource>> {
    #[cfg(windows)]
    {
        Some(Box::new(NtCpuTimes))
    }
    #[cfg(all(unix, not(windows)))]
    {
        Some(Box::new(ProcStat::default()))
    }
    #[cfg(not(any(windows, unix)))]
    {
        None
    }
}

pub struct CpuLoad {
    source: Option<Box<dyn CpuTimesSource>>,
    baseline: Option<CpuTimes>,
    thread_loads: Vec<f32>,
    total_load: f32,
}

impl Default for CpuLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuLoad {
    pub fn new() -> Self {
        match platform_source() {
            Some(source) => Self::with_source(source),
            None => Self::unavailable(),
        }
    }

    /// Takes the first snapshot immediately. If that fails the instance is
    /// permanently unavailable.
    pub fn with_source(mut source: Box<dyn CpuTimesSource>) -> Self {
        match source.sample().filter(|t| !t.is_empty()) {
            Some(baseline) => Self {
                thread_loads: vec![0.0; baseline.len()],
                source: Some(source),
                baseline: Some(baseline),
                total_load: 0.0,
            },
            None => {
                warn!("cpu time counters unavailable, load sensors disabled");
                Self::unavailable()
            }
        }
    }

    fn unavailable() -> Self {
        Self {
            source: None,
            baseline: None,
            thread_loads: Vec::new(),
            total_load: 0.0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.source.is_some()
    }

    /// Load of logical processor `index` in percent, 0 if out of range.
    pub fn thread_load(&self, index: usize) -> f32 {
        self.thread_loads.get(index).copied().unwrap_or(0.0)
    }

    pub fn thread_loads(&self) -> &[f32] {
        &self.thread_loads
    }

    pub fn total_load(&self) -> f32 {
        self.total_load
    }

    /// Take a new snapshot and recompute loads against the baseline.
    ///
    /// Snapshots closer than the source's noise floor are discarded and the
    /// baseline kept, so the next call measures a longer span. A change in
    /// processor count resets the baseline.
    pub fn update(&mut self) {
        let Some(source) = self.source.as_mut() else { return };
        let Some(current) = source.sample().filter(|t| !t.is_empty()) else { return };
        let floor = source.noise_floor();

        let Some(baseline) = self.baseline.as_ref().filter(|b| b.len() == current.len()) else {
            debug!(threads = current.len(), "processor count changed, resetting load baseline");
            self.thread_loads = vec![0.0; current.len()];
            self.baseline = Some(current);
            return;
        };

        let deltas: Vec<(u64, u64)> = (0..current.len())
            .map(|i| {
                (
                    current.idle[i].saturating_sub(baseline.idle[i]),
                    current.total[i].saturating_sub(baseline.total[i]),
                )
            })
            .collect();
        let min_total = deltas.iter().map(|&(_, total)| total).min().unwrap_or(0);
        if min_total < floor || min_total == 0 {
            return;
        }

        let mut idle_fraction_sum = 0.0f64;
        for (load, &(idle, total)) in self.thread_loads.iter_mut().zip(&deltas) {
            let idle_fraction = (idle as f64 / total as f64).min(1.0);
            idle_fraction_sum += idle_fraction;
            *load = to_percent(idle_fraction);
        }
        self.total_load = to_percent(idle_fraction_sum / deltas.len() as f64);
        self.baseline = Some(current);
    }
}

fn to_percent(idle_fraction: f64) -> f32 {
    (100.0 * (1.0 - idle_fraction)).clamp(0.0, 100.0) as f32
}
