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

//! Process-wide bus mutexes.
//!
//! Sensor code that drives the ISA bridge, PCI config mechanism or SMBus
//! host controller through several IOCTLs in a row takes the matching lock
//! first so two readers never interleave their sequences.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::constants::timing::BUS_TIMEOUT_MS;

pub type BusGuard<'a> = MutexGuard<'a, ()>;

#[derive(Debug)]
pub struct BusLocks {
    isa: Mutex<()>,
    pci: Mutex<()>,
    smbus: Mutex<()>,
    timeout: Duration,
}

impl Default for BusLocks {
    fn default() -> Self {
        Self::new(Duration::from_millis(BUS_TIMEOUT_MS))
    }
}

impl BusLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            isa: Mutex::new(()),
            pci: Mutex::new(()),
            smbus: Mutex::new(()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn lock_isa(&self) -> Option<BusGuard<'_>> {
        self.lock_isa_for(self.timeout)
    }

    pub fn lock_isa_for(&self, timeout: Duration) -> Option<BusGuard<'_>> {
        acquire(&self.isa, "isa", timeout)
    }

    pub fn lock_pci(&self) -> Option<BusGuard<'_>> {
        self.lock_pci_for(self.timeout)
    }

    pub fn lock_pci_for(&self, timeout: Duration) -> Option<BusGuard<'_>> {
        acquire(&self.pci, "pci", timeout)
    }

    pub fn lock_smbus(&self) -> Option<BusGuard<'_>> {
        self.lock_smbus_for(self.timeout)
    }

    pub fn lock_smbus_for(&self, timeout: Duration) -> Option<BusGuard<'_>> {
        acquire(&self.smbus, "smbus", timeout)
    }
}

fn acquire<'a>(lock: &'a Mutex<()>, bus: &str, timeout: Duration) -> Option<BusGuard<'a>> {
    let guard = lock.try_lock_for(timeout);
    if guard.is_none() {
        debug!(bus, ?timeout, "bus lock busy");
    }
    guard
}
