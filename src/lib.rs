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

//! Hwprobe - low-level hardware access for telemetry
//!
//! This library provides the layer hardware sensors sit on: thread and
//! processor-group affinity, CPUID based topology decoding, CPU load
//! sampling, and a Ring0 context that installs a kernel driver and turns
//! MSR, PCI configuration, I/O port and physical memory access into
//! driver requests.

pub mod affinity;
pub mod bus;
pub mod config;
pub mod constants;
pub mod cpu_load;
pub mod cpuid;
pub mod driver;
pub mod error;
pub mod logger;
pub mod ring0;
pub mod topology;

pub use affinity::{GroupAffinity, ThreadAffinity};
pub use config::Ring0Config;
pub use cpu_load::CpuLoad;
pub use cpuid::CpuId;
pub use error::{ProbeError, Result};
pub use ring0::{pci_address, Ring0, INVALID_PCI_ADDRESS};
pub use topology::CpuTopology;
