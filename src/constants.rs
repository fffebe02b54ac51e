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

//! Constants shared across the hardware access layer.
//!
//! Keeps the driver ABI numbers, timing values and platform limits in one
//! place so the modules that use them stay free of magic numbers.

use std::time::Duration;

/// Identity and packaging of the privileged driver
pub mod driver {
    /// Device name the kernel driver registers (`\\.\<DRIVER_ID>`)
    pub const DRIVER_ID: &str = "WinRing0_1_2_0";

    /// Compressed driver image for 64-bit hosts
    pub const IMAGE_X64: &str = "ring0_x64.sys.gz";

    /// Compressed driver image for 32-bit hosts
    pub const IMAGE_X86: &str = "ring0_x86.sys.gz";

    /// Extension given to the extracted driver image
    pub const IMAGE_EXTENSION: &str = "sys";

    /// Fallback service name when the host executable cannot be resolved
    pub const FALLBACK_SERVICE_NAME: &str = env!("CARGO_PKG_NAME");

    /// Security descriptor applied to the device object after install:
    /// full access for SYSTEM and built-in Administrators only.
    pub const DEVICE_SDDL: &str = "O:BAG:SYD:(A;;FA;;;SY)(A;;FA;;;BA)";
}

/// IOCTL numbering used by the driver ABI
pub mod ioctl {
    /// Device type the driver was built with
    pub const DEVICE_TYPE: u32 = 40000;

    pub const METHOD_BUFFERED: u32 = 0;

    pub const FILE_ANY_ACCESS: u32 = 0;
    pub const FILE_READ_ACCESS: u32 = 1;
    pub const FILE_WRITE_ACCESS: u32 = 2;

    // Function numbers
    pub const FN_GET_REFCOUNT: u32 = 0x801;
    pub const FN_READ_MSR: u32 = 0x821;
    pub const FN_WRITE_MSR: u32 = 0x822;
    pub const FN_READ_IO_PORT_BYTE: u32 = 0x833;
    pub const FN_WRITE_IO_PORT_BYTE: u32 = 0x836;
    pub const FN_READ_MEMORY: u32 = 0x841;
    pub const FN_READ_PCI_CONFIG: u32 = 0x851;
    pub const FN_WRITE_PCI_CONFIG: u32 = 0x852;
}

/// Timing values for driver lifecycle and bus access
pub mod timing {
    use super::Duration;

    /// How long to wait for an extracted driver image to land on disk
    pub const EXTRACT_TIMEOUT_MS: u64 = 2000;

    /// Poll interval while waiting for the extracted image
    pub const EXTRACT_POLL: Duration = Duration::from_millis(100);

    /// Pause between a failed install and the single retry
    pub const INSTALL_RETRY_DELAY_MS: u64 = 2000;

    /// Default timeout when acquiring a bus mutex
    pub const BUS_TIMEOUT_MS: u64 = 10;
}

/// CPU enumeration and CPUID limits
pub mod cpu {
    /// Threads probed per processor group
    pub const MAX_THREADS_PER_GROUP: u32 = 64;

    /// Upper bound on standard and extended CPUID leaves captured
    pub const MAX_CPUID_LEAVES: u32 = 1024;

    /// First extended CPUID leaf
    pub const CPUID_EXT: u32 = 0x8000_0000;

    /// Sentinel group meaning "no affinity"
    pub const UNDEFINED_GROUP: u16 = 0xFFFF;
}

/// CPU load sampling
pub mod load {
    /// Minimum total-time delta (USER_HZ ticks) before /proc/stat samples count
    pub const UNIX_NOISE_FLOOR: u64 = 100;

    /// Minimum total-time delta (100ns units) before NT samples count
    pub const WINDOWS_NOISE_FLOOR: u64 = 100_000;

    /// Kernel CPU time accounting file
    pub const PROC_STAT: &str = "/proc/stat";

    /// Columns of a `cpuN` line summed into total time
    pub const STAT_COLUMNS: usize = 10;

    /// Column of a `cpuN` line holding idle time (1-based, after the label)
    pub const STAT_IDLE_COLUMN: usize = 4;
}

/// Configuration file locations
pub mod paths {
    /// Environment variable overriding the config file path
    pub const CONFIG_ENV: &str = "HWPROBE_CONFIG";

    /// Directory name under the user's config dir
    pub const CONFIG_DIR_NAME: &str = "hwprobe";

    pub const CONFIG_FILE: &str = "config.json";

    /// System-wide config file
    pub const SYSTEM_CONFIG: &str = "/etc/hwprobe/config.json";

    /// Environment variable read by `logger::init_logging`
    pub const LOG_ENV: &str = "HWPROBE_LOG";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_leaf_base() {
        assert_eq!(cpu::CPUID_EXT + 8, 0x8000_0008);
    }
}
