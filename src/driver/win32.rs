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

//! Windows kernel driver backed by the service control manager.

use std::ffi::c_void;
use std::path::Path;

use ::windows::core::{HSTRING, PCWSTR};
use ::windows::Win32::Foundation::{
    CloseHandle, LocalFree, ERROR_SERVICE_ALREADY_RUNNING, ERROR_SERVICE_EXISTS, GENERIC_READ,
    GENERIC_WRITE, HANDLE, HLOCAL,
};
use ::windows::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use ::windows::Win32::Security::{
    SetFileSecurityW, DACL_SECURITY_INFORMATION, GROUP_SECURITY_INFORMATION,
    OWNER_SECURITY_INFORMATION, PSECURITY_DESCRIPTOR,
};
use ::windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_NONE, OPEN_EXISTING,
};
use ::windows::Win32::System::Services::{
    CloseServiceHandle, ControlService, CreateServiceW, DeleteService, OpenSCManagerW,
    OpenServiceW, StartServiceW, SC_HANDLE, SC_MANAGER_ALL_ACCESS, SERVICE_ALL_ACCESS,
    SERVICE_CONTROL_STOP, SERVICE_DEMAND_START, SERVICE_ERROR_NORMAL, SERVICE_KERNEL_DRIVER,
    SERVICE_STATUS,
};
use ::windows::Win32::System::IO::DeviceIoControl;
use tracing::{debug, info, warn};

use super::ioctl::IoControlCode;
use super::{DeviceDriver, DriverIdentity};
use crate::constants::driver::DEVICE_SDDL;
use crate::error::{ProbeError, Result};

/// Service control manager handle, closed on drop.
struct ScHandle(SC_HANDLE);

impl Drop for ScHandle {
    fn drop(&mut self) {
        // SAFETY: the handle came from OpenSCManagerW/CreateServiceW/OpenServiceW.
        unsafe {
            let _ = CloseServiceHandle(self.0);
        }
    }
}

/// Open device handle.
struct DeviceHandle(HANDLE);

// SAFETY: kernel object handles are process-wide and valid from any thread.
unsafe impl Send for DeviceHandle {}
// SAFETY: DeviceIoControl on a shared handle is thread-safe; the driver
// serialises its own hardware access.
unsafe impl Sync for DeviceHandle {}

fn open_manager() -> Result<ScHandle> {
    // SAFETY: null machine and database names select the local active database.
    unsafe { OpenSCManagerW(PCWSTR::null(), PCWSTR::null(), SC_MANAGER_ALL_ACCESS) }
        .map(ScHandle)
        .map_err(|e| ProbeError::ServiceManagerUnavailable(e.to_string()))
}

pub struct KernelDriver {
    identity: DriverIdentity,
    device: Option<DeviceHandle>,
}

impl KernelDriver {
    pub fn new(identity: DriverIdentity) -> Self {
        Self {
            identity,
            device: None,
        }
    }

    pub fn identity(&self) -> &DriverIdentity {
        &self.identity
    }

    /// Limit the device object to SYSTEM and built-in Administrators.
    fn restrict_device_access(&self) -> Result<()> {
        let sddl = HSTRING::from(DEVICE_SDDL);
        let mut descriptor = PSECURITY_DESCRIPTOR::default();
        // SAFETY: `descriptor` receives a LocalAlloc'd buffer freed below.
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                &sddl,
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )
        }
        .map_err(|e| ProbeError::generic(format!("invalid device SDDL: {e}")))?;

        let device = HSTRING::from(self.identity.device_path());
        // SAFETY: `descriptor` is a valid self-relative descriptor until LocalFree.
        let applied = unsafe {
            SetFileSecurityW(
                &device,
                OWNER_SECURITY_INFORMATION | GROUP_SECURITY_INFORMATION | DACL_SECURITY_INFORMATION,
                descriptor,
            )
        };
        // SAFETY: allocated by ConvertStringSecurityDescriptorToSecurityDescriptorW.
        unsafe {
            let _ = LocalFree(HLOCAL(descriptor.0));
        }

        if applied.as_bool() {
            Ok(())
        } else {
            Err(ProbeError::generic("SetFileSecurityW failed"))
        }
    }
}

impl DeviceDriver for KernelDriver {
    fn install(&mut self, image: &Path) -> Result<()> {
        let manager = open_manager()?;
        let name = HSTRING::from(self.identity.service_name.as_str());
        let binary = HSTRING::from(image.as_os_str());

        // SAFETY: all string arguments outlive the call; optional ones are null.
        let created = unsafe {
            CreateServiceW(
                manager.0,
                &name,
                &name,
                SERVICE_ALL_ACCESS,
                SERVICE_KERNEL_DRIVER,
                SERVICE_DEMAND_START,
                SERVICE_ERROR_NORMAL,
                &binary,
                PCWSTR::null(),
                None,
                PCWSTR::null(),
                PCWSTR::null(),
                PCWSTR::null(),
            )
        };
        let service = match created {
            Ok(handle) => ScHandle(handle),
            Err(e) if e.code() == ERROR_SERVICE_EXISTS.to_hresult() => {
                return Err(ProbeError::ServiceExists(self.identity.service_name.clone()));
            }
            Err(e) => {
                return Err(ProbeError::ServiceCreate {
                    name: self.identity.service_name.clone(),
                    reason: e.to_string(),
                });
            }
        };

        // SAFETY: `service` is a live service handle.
        if let Err(e) = unsafe { StartServiceW(service.0, None) } {
            if e.code() != ERROR_SERVICE_ALREADY_RUNNING.to_hresult() {
                return Err(ProbeError::ServiceStart {
                    name: self.identity.service_name.clone(),
                    reason: e.to_string(),
                });
            }
        }
        drop(service);
        drop(manager);
        info!(service = %self.identity.service_name, image = %image.display(), "kernel driver service started");

        if let Err(e) = self.restrict_device_access() {
            warn!("could not restrict driver device access: {e}");
        }
        Ok(())
    }

    fn open(&mut self) -> bool {
        let device = HSTRING::from(self.identity.device_path());
        // SAFETY: plain CreateFileW on a device path; no security attributes or template.
        let opened = unsafe {
            CreateFileW(
                &device,
                (GENERIC_READ | GENERIC_WRITE).0,
                FILE_SHARE_NONE,
                None,
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                HANDLE::default(),
            )
        };
        match opened {
            Ok(handle) if !handle.is_invalid() => {
                self.device = Some(DeviceHandle(handle));
                debug!(device = %self.identity.device_path(), "driver device opened");
                true
            }
            Ok(_) => {
                self.close();
                false
            }
            Err(e) => {
                debug!(device = %self.identity.device_path(), "driver device not available: {e}");
                self.close();
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn io_control(&self, code: IoControlCode, input: &[u8], output: &mut [u8]) -> bool {
        let Some(device) = self.device.as_ref() else {
            return false;
        };
        let in_ptr = (!input.is_empty()).then(|| input.as_ptr().cast::<c_void>());
        let out_ptr = (!output.is_empty()).then(|| output.as_mut_ptr().cast::<c_void>());
        let mut returned = 0u32;
        // SAFETY: buffers are valid for the lengths passed and outlive the
        // synchronous call.
        unsafe {
            DeviceIoControl(
                device.0,
                code.code(),
                in_ptr,
                input.len() as u32,
                out_ptr,
                output.len() as u32,
                Some(&mut returned as *mut u32),
                None,
            )
        }
        .is_ok()
    }

    fn close(&mut self) {
        if let Some(device) = self.device.take() {
            // SAFETY: handle came from CreateFileW and is closed exactly once.
            unsafe {
                let _ = CloseHandle(device.0);
            }
        }
    }

    fn delete(&mut self) -> bool {
        let Ok(manager) = open_manager() else {
            return false;
        };
        let name = HSTRING::from(self.identity.service_name.as_str());
        // SAFETY: `name` outlives the call.
        let service = match unsafe { OpenServiceW(manager.0, &name, SERVICE_ALL_ACCESS) } {
            Ok(handle) => ScHandle(handle),
            Err(_) => return true,
        };

        let mut status = SERVICE_STATUS::default();
        // SAFETY: `service` is live; `status` is writable.
        unsafe {
            let _ = ControlService(service.0, SERVICE_CONTROL_STOP, &mut status);
        }
        // SAFETY: `service` is live.
        if let Err(e) = unsafe { DeleteService(service.0) } {
            warn!(service = %self.identity.service_name, "DeleteService failed: {e}");
        } else {
            info!(service = %self.identity.service_name, "kernel driver service removed");
        }
        true
    }
}

impl Drop for KernelDriver {
    fn drop(&mut self) {
        self.close();
    }
}
