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

//! The Ring0 context: owns the kernel driver for the life of the host.
//!
//! [`Ring0::open`] brings the driver up (reusing a running instance when
//! possible, otherwise extracting and installing it), the typed wrappers
//! translate MSR, PCI configuration, I/O port and physical memory access
//! into IOCTLs, and [`Ring0::close`] tears it down again. The service is only
//! deleted when no other process still holds the device.
//!
//! Every wrapper checks that the driver is open first and returns `None`,
//! `false` or zero without touching the OS otherwise.

use std::fs;
use std::mem::size_of_val;
use std::path::{Path, PathBuf};
use std::thread;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::affinity::{GroupAffinity, ThreadAffinity};
use crate::bus::BusLocks;
use crate::config::Ring0Config;
use crate::driver::image::{candidate_paths, extract, writable_path, DriverImage};
use crate::driver::ioctl::{
    self, IoBuffer, ReadMemoryInput, ReadPciConfigInput, WriteIoPortInput, WriteMsrInput,
    WritePciConfigInput,
};
use crate::driver::{DeviceDriver, DeviceDriverExt, KernelDriver};
use crate::error::ProbeError;

/// Returned by PCI device discovery when nothing matched.
pub const INVALID_PCI_ADDRESS: u32 = 0xFFFF_FFFF;

/// Pack a bus/device/function triple into the driver's PCI address format.
pub fn pci_address(bus: u8, device: u8, function: u8) -> u32 {
    (u32::from(bus) << 8) | ((u32::from(device) & 0x1F) << 3) | (u32::from(function) & 0x07)
}

struct Ring0State<D> {
    driver: D,
    /// Extracted driver image we are responsible for deleting.
    file_path: Option<PathBuf>,
    report: Vec<String>,
}

pub struct Ring0<D: DeviceDriver = KernelDriver> {
    config: Ring0Config,
    image: DriverImage,
    state: RwLock<Ring0State<D>>,
    bus: BusLocks,
}

impl Ring0<KernelDriver> {
    /// Context for the platform kernel driver described by `config`.
    pub fn new(config: Ring0Config) -> Self {
        let driver = KernelDriver::new(config.identity());
        let image = config.driver_image();
        Self::with_driver(config, driver, image)
    }
}

impl<D: DeviceDriver> Ring0<D> {
    pub fn with_driver(config: Ring0Config, driver: D, image: DriverImage) -> Self {
        let bus = BusLocks::new(config.bus_timeout());
        Self {
            config,
            image,
            state: RwLock::new(Ring0State {
                driver,
                file_path: None,
                report: Vec::new(),
            }),
            bus,
        }
    }

    pub fn config(&self) -> &Ring0Config {
        &self.config
    }

    /// Mutexes serialising multi-step bus transactions.
    pub fn bus(&self) -> &BusLocks {
        &self.bus
    }

    pub fn is_open(&self) -> bool {
        self.state.read().driver.is_open()
    }

    /// Path of the extracted driver image, while we own one.
    pub fn driver_file(&self) -> Option<PathBuf> {
        self.state.read().file_path.clone()
    }

    /// Bring the driver up. Idempotent; failures are recorded in
    /// [`report`](Self::report) and leave the context closed.
    pub fn open(&self) {
        let mut state = self.state.write();
        if state.driver.is_open() {
            return;
        }
        if !state.driver.is_supported() {
            debug!("kernel driver not supported on this platform");
            return;
        }
        state.report.clear();

        if state.driver.open() {
            info!("attached to running kernel driver");
            return;
        }

        let service_name = self.config.service_name();
        let candidates = candidate_paths(&service_name, self.config.extract_dir.as_deref());
        let Some(path) = writable_path(&candidates) else {
            state.report.push("Status: No writable location for the driver image".to_string());
            return;
        };

        if let Err(e) = extract(&self.image, &path, self.config.extract_timeout()) {
            warn!("driver extraction failed: {e:#}");
            state.report.push(format!("Status: Extracting driver failed: {e:#}"));
            remove_image(&path);
            return;
        }
        state.file_path = Some(path.clone());

        let installed = match state.driver.install(&path) {
            Ok(()) => true,
            Err(e) => {
                warn!("driver install failed, retrying: {e}");
                state.report.push(format!("Status: Installing driver failed: {e}"));
                // A stale service registration is the usual cause.
                state.driver.delete();
                thread::sleep(self.config.install_retry_delay());
                match state.driver.install(&path) {
                    Ok(()) => true,
                    Err(e) => {
                        state.report.push(format!("Status: Installing driver failed again: {e}"));
                        false
                    }
                }
            }
        };

        if installed && state.driver.open() {
            info!(path = %path.display(), "kernel driver installed and opened");
            return;
        }
        if installed {
            state.report.push("Status: Opening driver failed after install".to_string());
        }

        state.driver.delete();
        if let Some(path) = state.file_path.take() {
            remove_image(&path);
        }
        warn!("kernel driver unavailable");
    }

    /// Tear the driver down. The service is only deleted when our handle was
    /// the last one.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.driver.is_open() {
            let mut refcount = 0u32;
            state.driver.query(ioctl::GET_REFCOUNT, &mut refcount);
            state.driver.close();
            if refcount <= 1 {
                if !state.driver.delete() {
                    warn!("failed to delete driver service");
                }
            } else {
                debug!(refcount, "driver still in use elsewhere, keeping service");
            }
        }
        if let Some(path) = state.file_path.take() {
            remove_image(&path);
        }
    }

    /// Diagnostic text from the last [`open`](Self::open).
    pub fn report(&self) -> String {
        let state = self.state.read();
        if state.report.is_empty() {
            return String::new();
        }
        let mut out = String::from("Ring0\n\n");
        for line in &state.report {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    /// Read MSR `index` on the current processor as `(eax, edx)`.
    pub fn read_msr(&self, index: u32) -> Option<(u32, u32)> {
        let state = self.state.read();
        if !state.driver.is_open() {
            return None;
        }
        let mut value = 0u64;
        if !state.driver.request(ioctl::READ_MSR, &index, &mut value) {
            return None;
        }
        Some((value as u32, (value >> 32) as u32))
    }

    /// Read MSR `index` with the calling thread pinned to `affinity`.
    ///
    /// `None` if the thread cannot be moved there; an MSR read on the wrong
    /// core is worse than no reading.
    pub fn read_msr_on(&self, index: u32, affinity: GroupAffinity) -> Option<(u32, u32)> {
        if !self.is_open() {
            return None;
        }
        self.pinned(affinity, || self.read_msr(index)).flatten()
    }

    pub fn write_msr(&self, index: u32, eax: u32, edx: u32) -> bool {
        let state = self.state.read();
        if !state.driver.is_open() {
            return false;
        }
        let input = WriteMsrInput {
            register: index,
            value: (u64::from(edx) << 32) | u64::from(eax),
        };
        state.driver.send(ioctl::WRITE_MSR, &input)
    }

    pub fn write_msr_on(&self, index: u32, eax: u32, edx: u32, affinity: GroupAffinity) -> bool {
        if !self.is_open() {
            return false;
        }
        self.pinned(affinity, || self.write_msr(index, eax, edx)).unwrap_or(false)
    }

    fn pinned<T>(&self, affinity: GroupAffinity, f: impl FnOnce() -> T) -> Option<T> {
        match ThreadAffinity::pin(affinity) {
            Ok(Some(_guard)) => Some(f()),
            Ok(None) if affinity.is_undefined() => Some(f()),
            Ok(None) => {
                debug!(%affinity, "could not pin thread for MSR access");
                None
            }
            Err(e) => {
                debug!(%affinity, "could not pin thread for MSR access: {e}");
                None
            }
        }
    }

    /// Read one byte from I/O port `port`. Zero when closed or on failure.
    pub fn read_io_port(&self, port: u16) -> u8 {
        let state = self.state.read();
        if !state.driver.is_open() {
            return 0;
        }
        let mut value = 0u32;
        state.driver.request(ioctl::READ_IO_PORT_BYTE, &u32::from(port), &mut value);
        (value & 0xFF) as u8
    }

    pub fn write_io_port(&self, port: u16, value: u8) -> bool {
        let state = self.state.read();
        if !state.driver.is_open() {
            return false;
        }
        let input = WriteIoPortInput { port: u32::from(port), value };
        state.driver.send(ioctl::WRITE_IO_PORT_BYTE, &input)
    }

    /// Read a dword of PCI configuration space. `register` must be 4-byte
    /// aligned.
    pub fn read_pci_config(&self, pci_address: u32, register: u32) -> Option<u32> {
        let state = self.state.read();
        if !state.driver.is_open() || !pci_register_aligned(register) {
            return None;
        }
        let input = ReadPciConfigInput { pci_address, register };
        let mut value = 0u32;
        state
            .driver
            .request(ioctl::READ_PCI_CONFIG, &input, &mut value)
            .then_some(value)
    }

    pub fn write_pci_config(&self, pci_address: u32, register: u32, value: u32) -> bool {
        let state = self.state.read();
        if !state.driver.is_open() || !pci_register_aligned(register) {
            return false;
        }
        let input = WritePciConfigInput { pci_address, register, value };
        state.driver.send(ioctl::WRITE_PCI_CONFIG, &input)
    }

    /// Read a `T` from physical memory at `address`.
    pub fn read_memory<T: IoBuffer>(&self, address: u64) -> Option<T> {
        let state = self.state.read();
        if !state.driver.is_open() {
            return None;
        }
        let mut value = T::zeroed();
        let input = ReadMemoryInput {
            address,
            unit_size: 1,
            count: std::mem::size_of::<T>() as u32,
        };
        state
            .driver
            .request(ioctl::READ_MEMORY, &input, &mut value)
            .then_some(value)
    }

    /// Fill `buffer` from physical memory starting at `address`.
    pub fn read_memory_into<T: IoBuffer>(&self, address: u64, buffer: &mut [T]) -> bool {
        let state = self.state.read();
        if !state.driver.is_open() {
            return false;
        }
        let input = ReadMemoryInput {
            address,
            unit_size: 1,
            count: size_of_val(buffer) as u32,
        };
        state.driver.request_slice(ioctl::READ_MEMORY, &input, buffer)
    }
}

impl<D: DeviceDriver> Drop for Ring0<D> {
    fn drop(&mut self) {
        self.close();
    }
}

fn pci_register_aligned(register: u32) -> bool {
    if register & 3 != 0 {
        debug!("{}", ProbeError::MisalignedPciRegister(register));
        return false;
    }
    true
}

fn remove_image(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!(path = %path.display(), "could not remove driver image: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;
    use crate::driver::ioctl::IoControlCode;
    use crate::error::Result;

    #[derive(Default)]
    struct FakeLog {
        supported: bool,
        running: bool,
        open: bool,
        open_fails: bool,
        install_failures: u32,
        refcount: u32,
        installs: u32,
        opens: u32,
        deletes: u32,
        closes: u32,
        ioctls: Vec<(u32, Vec<u8>)>,
        installed_from: Option<PathBuf>,
    }

    #[derive(Clone, Default)]
    struct FakeDriver(Arc<Mutex<FakeLog>>);

    impl FakeDriver {
        fn supported() -> Self {
            let fake = Self::default();
            fake.0.lock().supported = true;
            fake.0.lock().refcount = 1;
            fake
        }

        fn log(&self) -> parking_lot::MutexGuard<'_, FakeLog> {
            self.0.lock()
        }
    }

    impl DeviceDriver for FakeDriver {
        fn is_supported(&self) -> bool {
            self.0.lock().supported
        }

        fn install(&mut self, image: &Path) -> Result<()> {
            let mut log = self.0.lock();
            log.installs += 1;
            assert!(image.exists(), "install called before extraction");
            log.installed_from = Some(image.to_path_buf());
            if log.install_failures > 0 {
                log.install_failures -= 1;
                return Err(ProbeError::ServiceExists("fake".into()));
            }
            log.running = true;
            Ok(())
        }

        fn open(&mut self) -> bool {
            let mut log = self.0.lock();
            log.opens += 1;
            log.open = log.running && !log.open_fails;
            log.open
        }

        fn is_open(&self) -> bool {
            self.0.lock().open
        }

        fn io_control(&self, code: IoControlCode, input: &[u8], output: &mut [u8]) -> bool {
            let mut log = self.0.lock();
            log.ioctls.push((code.code(), input.to_vec()));
            if !log.open {
                return false;
            }
            if code == ioctl::GET_REFCOUNT {
                output.copy_from_slice(&log.refcount.to_ne_bytes());
            } else if code == ioctl::READ_MSR {
                output.copy_from_slice(&0x0000_00AA_0000_0055u64.to_ne_bytes());
            } else if code == ioctl::READ_IO_PORT_BYTE {
                output.copy_from_slice(&0x1234_56ABu32.to_ne_bytes());
            } else if code == ioctl::READ_PCI_CONFIG {
                output.copy_from_slice(&0x8086_1234u32.to_ne_bytes());
            } else if code == ioctl::READ_MEMORY {
                for (i, b) in output.iter_mut().enumerate() {
                    *b = i as u8;
                }
            }
            true
        }

        fn close(&mut self) {
            let mut log = self.0.lock();
            log.closes += 1;
            log.open = false;
        }

        fn delete(&mut self) -> bool {
            let mut log = self.0.lock();
            log.deletes += 1;
            log.running = false;
            true
        }
    }

    fn packaged_image() -> DriverImage {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[0x01]).unwrap();
        encoder.write_all(b"MZ fake driver").unwrap();
        DriverImage::from_compressed(encoder.finish().unwrap())
    }

    fn ring0(fake: &FakeDriver, dir: &TempDir) -> Ring0<FakeDriver> {
        let config = Ring0Config {
            service_name: Some("hwprobe_test".into()),
            extract_dir: Some(dir.path().to_path_buf()),
            install_retry_delay_ms: 0,
            ..Default::default()
        };
        Ring0::with_driver(config, fake.clone(), packaged_image())
    }

    #[test]
    fn test_pci_address_packing() {
        assert_eq!(pci_address(0, 0, 0), 0);
        assert_eq!(pci_address(0, 0x18, 3), 0xC3);
        assert_eq!(pci_address(1, 2, 3), 0x113);
        assert_eq!(pci_address(0xFF, 0x3F, 0xF), 0xFFFF);
        assert_ne!(pci_address(0xFF, 0x1F, 7), INVALID_PCI_ADDRESS);
    }

    #[test]
    fn test_closed_context_makes_no_driver_calls() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        let ring0 = ring0(&fake, &dir);

        assert!(!ring0.is_open());
        assert_eq!(ring0.read_msr(0x1A0), None);
        assert_eq!(ring0.read_msr_on(0x1A0, GroupAffinity::single(0, 0)), None);
        assert!(!ring0.write_msr(0x1A0, 1, 2));
        assert_eq!(ring0.read_io_port(0x2E), 0);
        assert!(!ring0.write_io_port(0x2E, 0x87));
        assert_eq!(ring0.read_pci_config(0, 0), None);
        assert!(!ring0.write_pci_config(0, 0, 0));
        assert_eq!(ring0.read_memory::<u32>(0xF0000), None);
        let mut buf = [0u8; 8];
        assert!(!ring0.read_memory_into(0xF0000, &mut buf));

        assert!(fake.log().ioctls.is_empty());
    }

    #[test]
    fn test_unsupported_platform_is_noop() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::default();
        let ring0 = ring0(&fake, &dir);
        ring0.open();
        assert!(!ring0.is_open());
        let log = fake.log();
        assert_eq!((log.opens, log.installs, log.deletes), (0, 0, 0));
        drop(log);
        assert!(ring0.report().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_attaches_to_running_driver_without_install() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        fake.log().running = true;
        let ring0 = ring0(&fake, &dir);
        ring0.open();
        assert!(ring0.is_open());
        assert_eq!(fake.log().installs, 0);
        assert!(ring0.driver_file().is_none());
    }

    #[test]
    fn test_open_extracts_installs_and_close_cleans_up() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        let ring0 = ring0(&fake, &dir);

        ring0.open();
        assert!(ring0.is_open());
        let file = ring0.driver_file().unwrap();
        assert_eq!(file, dir.path().join("hwprobe_test.sys"));
        assert_eq!(std::fs::read(&file).unwrap(), b"MZ fake driver");
        assert_eq!(fake.log().installed_from.as_deref(), Some(file.as_path()));

        // Second open is a no-op.
        ring0.open();
        assert_eq!(fake.log().installs, 1);

        ring0.close();
        assert!(!ring0.is_open());
        assert!(!file.exists());
        let log = fake.log();
        assert_eq!(log.deletes, 1);
        assert_eq!(log.closes, 1);
        assert_eq!(log.ioctls.last().map(|(c, _)| *c), Some(ioctl::GET_REFCOUNT.code()));
    }

    #[test]
    fn test_close_keeps_service_while_referenced() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        let ring0 = ring0(&fake, &dir);
        ring0.open();
        let file = ring0.driver_file().unwrap();
        fake.log().refcount = 2;

        ring0.close();
        assert_eq!(fake.log().deletes, 0);
        assert_eq!(fake.log().closes, 1);
        assert!(!file.exists());
    }

    #[test]
    fn test_install_retried_once_after_delete() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        fake.log().install_failures = 1;
        let ring0 = ring0(&fake, &dir);

        ring0.open();
        assert!(ring0.is_open());
        let log = fake.log();
        assert_eq!(log.installs, 2);
        assert_eq!(log.deletes, 1);
        drop(log);
        assert!(ring0.report().contains("Installing driver failed"));
    }

    #[test]
    fn test_failed_install_rolls_back() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        fake.log().install_failures = 2;
        let ring0 = ring0(&fake, &dir);

        ring0.open();
        assert!(!ring0.is_open());
        assert!(ring0.driver_file().is_none());
        assert!(!dir.path().join("hwprobe_test.sys").exists());
        assert_eq!(fake.log().installs, 2);
        let report = ring0.report();
        assert!(report.starts_with("Ring0\n\n"));
        assert!(report.contains("failed again"));
    }

    #[test]
    fn test_open_failure_after_install_rolls_back() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        fake.log().open_fails = true;
        let ring0 = ring0(&fake, &dir);

        ring0.open();
        assert!(!ring0.is_open());
        assert!(!dir.path().join("hwprobe_test.sys").exists());
        assert_eq!(fake.log().deletes, 1);
        assert!(ring0.report().contains("Opening driver failed"));
    }

    #[test]
    fn test_missing_image_leaves_context_closed() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        let config = Ring0Config {
            extract_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let image = DriverImage::from_package(dir.path().join("absent.sys.gz"));
        let ring0 = Ring0::with_driver(config, fake.clone(), image);

        ring0.open();
        assert!(!ring0.is_open());
        assert_eq!(fake.log().installs, 0);
        assert!(ring0.report().contains("Extracting driver failed"));
    }

    #[test]
    fn test_typed_wrappers_when_open() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        let ring0 = ring0(&fake, &dir);
        ring0.open();

        assert_eq!(ring0.read_msr(0x19C), Some((0x55, 0xAA)));
        assert_eq!(ring0.read_io_port(0x2F), 0xAB);
        assert_eq!(ring0.read_pci_config(pci_address(0, 0x18, 3), 0xE4), Some(0x8086_1234));
        assert_eq!(ring0.read_memory::<u32>(0xF0000), Some(u32::from_ne_bytes([0, 1, 2, 3])));
        let mut buf = [0u8; 4];
        assert!(ring0.read_memory_into(0xF0000, &mut buf));
        assert_eq!(buf, [0, 1, 2, 3]);

        assert!(ring0.write_msr(0x199, 0x1122_3344, 0x5566_7788));
        assert!(ring0.write_io_port(0x2E, 0x87));
        assert!(ring0.write_pci_config(pci_address(0, 0, 0), 0x40, 7));

        let log = fake.log();
        let (_, msr_input) = log
            .ioctls
            .iter()
            .find(|(c, _)| *c == ioctl::WRITE_MSR.code())
            .unwrap();
        assert_eq!(&msr_input[..4], &0x199u32.to_ne_bytes());
        assert_eq!(&msr_input[4..], &0x5566_7788_1122_3344u64.to_ne_bytes());
        let (_, mem_input) = log
            .ioctls
            .iter()
            .find(|(c, _)| *c == ioctl::READ_MEMORY.code())
            .unwrap();
        assert_eq!(&mem_input[8..12], &1u32.to_ne_bytes());
        assert_eq!(&mem_input[12..], &4u32.to_ne_bytes());
    }

    #[test]
    fn test_misaligned_pci_register_rejected_without_ioctl() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        let ring0 = ring0(&fake, &dir);
        ring0.open();
        let before = fake.log().ioctls.len();

        assert_eq!(ring0.read_pci_config(0, 0x41), None);
        assert_eq!(ring0.read_pci_config(0, 0x42), None);
        assert!(!ring0.write_pci_config(0, 0x43, 1));
        assert_eq!(fake.log().ioctls.len(), before);
    }

    #[test]
    fn test_msr_on_undefined_affinity_reads_in_place() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        let ring0 = ring0(&fake, &dir);
        ring0.open();
        assert_eq!(ring0.read_msr_on(0x10, GroupAffinity::UNDEFINED), Some((0x55, 0xAA)));
        assert!(ring0.write_msr_on(0x10, 0, 0, GroupAffinity::UNDEFINED));
    }

    #[test]
    fn test_drop_closes() {
        let dir = TempDir::new().unwrap();
        let fake = FakeDriver::supported();
        let file = {
            let ring0 = ring0(&fake, &dir);
            ring0.open();
            ring0.driver_file().unwrap()
        };
        assert!(!file.exists());
        assert_eq!(fake.log().closes, 1);
        assert_eq!(fake.log().deletes, 1);
    }
}
