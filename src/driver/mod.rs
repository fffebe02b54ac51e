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

//! Handle to one named privileged kernel driver.
//!
//! Lifecycle: `install` (create and start the service) -> `open` (device
//! handle) -> any number of `io_control` calls -> `close` -> optional
//! `delete`. `open`/`close` must not race each other; IOCTLs on an open
//! handle may come from any thread.

pub mod image;
pub mod ioctl;

#[cfg(windows)]
mod win32;
#[cfg(windows)]
pub use self::win32::KernelDriver;

#[cfg(not(windows))]
mod unsupported;
#[cfg(not(windows))]
pub use self::unsupported::KernelDriver;

use std::path::Path;

use crate::error::Result;

use self::ioctl::{bytes_of, bytes_of_mut, slice_bytes_mut, IoBuffer, IoControlCode};

/// Names a driver service and the device object it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverIdentity {
    /// Service control manager name; unique per host binary.
    pub service_name: String,
    /// Device name, opened as `\\.\<driver_id>`.
    pub driver_id: String,
}

impl DriverIdentity {
    pub fn new(service_name: impl Into<String>, driver_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            driver_id: driver_id.into(),
        }
    }

    pub fn device_path(&self) -> String {
        format!(r"\\.\{}", self.driver_id)
    }
}

/// Operations the Ring0 context needs from a kernel driver.
pub trait DeviceDriver: Send + Sync {
    /// Whether this platform can host the driver at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Create and start the service for the driver image at `image`.
    fn install(&mut self, image: &Path) -> Result<()>;

    /// Open the device handle. Leaves the driver closed on failure.
    fn open(&mut self) -> bool;

    fn is_open(&self) -> bool;

    /// Issue one IOCTL. `false` if the handle is closed or the call failed.
    fn io_control(&self, code: IoControlCode, input: &[u8], output: &mut [u8]) -> bool;

    /// Release the handle. Idempotent.
    fn close(&mut self);

    /// Stop and remove the service. `true` if it is gone, including when it
    /// never existed.
    fn delete(&mut self) -> bool;
}

/// Typed helpers over [`DeviceDriver::io_control`].
pub trait DeviceDriverExt: DeviceDriver {
    /// IOCTL with no response payload.
    fn send<I: IoBuffer>(&self, code: IoControlCode, input: &I) -> bool {
        self.io_control(code, bytes_of(input), &mut [])
    }

    /// IOCTL with a fixed-size response.
    fn request<I: IoBuffer, O: IoBuffer>(&self, code: IoControlCode, input: &I, output: &mut O) -> bool {
        self.io_control(code, bytes_of(input), bytes_of_mut(output))
    }

    /// IOCTL without input and with a fixed-size response.
    fn query<O: IoBuffer>(&self, code: IoControlCode, output: &mut O) -> bool {
        self.io_control(code, &[], bytes_of_mut(output))
    }

    /// IOCTL with an array response.
    fn request_slice<I: IoBuffer, O: IoBuffer>(&self, code: IoControlCode, input: &I, output: &mut [O]) -> bool {
        self.io_control(code, bytes_of(input), slice_bytes_mut(output))
    }
}

impl<D: DeviceDriver + ?Sized> DeviceDriverExt for D {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path() {
        let id = DriverIdentity::new("hwprobe", "WinRing0_1_2_0");
        assert_eq!(id.device_path(), r"\\.\WinRing0_1_2_0");
    }

    #[cfg(not(windows))]
    #[test]
    fn test_delete_missing_service_is_success() {
        let mut driver = KernelDriver::new(DriverIdentity::new("hwprobe_test_absent_service", "NoSuchDevice"));
        assert!(driver.delete());
        assert!(driver.delete());
    }

    #[test]
    fn test_closed_driver_rejects_ioctls() {
        let driver = KernelDriver::new(DriverIdentity::new("hwprobe_test", "NoSuchDevice"));
        assert!(!driver.is_open());
        let mut out = 0u32;
        assert!(!driver.query(ioctl::GET_REFCOUNT, &mut out));
        assert_eq!(out, 0);
    }

    #[test]
    fn test_open_missing_device_fails_cleanly() {
        let mut driver = KernelDriver::new(DriverIdentity::new("hwprobe_test", "NoSuchDevice"));
        assert!(!driver.open());
        assert!(!driver.is_open());
        driver.close();
        driver.close();
    }
}
