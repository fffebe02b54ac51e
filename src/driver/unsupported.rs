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

//! Kernel driver stand-in for platforms without a loadable Ring0 driver.
//!
//! Nothing can be installed or opened; deletion trivially succeeds because
//! no service ever exists. Callers fall back to OS-exposed data.

use std::path::Path;

use tracing::debug;

use super::ioctl::IoControlCode;
use super::{DeviceDriver, DriverIdentity};
use crate::error::{ProbeError, Result};

#[derive(Debug)]
pub struct KernelDriver {
    identity: DriverIdentity,
}

impl KernelDriver {
    pub fn new(identity: DriverIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &DriverIdentity {
        &self.identity
    }
}

impl DeviceDriver for KernelDriver {
    fn is_supported(&self) -> bool {
        false
    }

    fn install(&mut self, _image: &Path) -> Result<()> {
        Err(ProbeError::not_supported("kernel driver services require Windows"))
    }

    fn open(&mut self) -> bool {
        debug!(device = %self.identity.device_path(), "kernel driver unavailable on this platform");
        false
    }

    fn is_open(&self) -> bool {
        false
    }

    fn io_control(&self, _code: IoControlCode, _input: &[u8], _output: &mut [u8]) -> bool {
        false
    }

    fn close(&mut self) {}

    fn delete(&mut self) -> bool {
        true
    }
}
