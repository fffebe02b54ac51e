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

//! IOCTL codes and request layouts of the kernel driver ABI.
//!
//! Every request/response struct here is passed to the driver as raw bytes,
//! so field order, size and packing must match the driver exactly. Sizes are
//! checked at compile time.

use std::mem::size_of;
use std::slice;

use static_assertions::const_assert_eq;

use crate::constants::ioctl::*;

/// A 32-bit device I/O control code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoControlCode(u32);

impl IoControlCode {
    /// `CTL_CODE(device_type, function, method, access)`
    pub const fn new(device_type: u32, function: u32, method: u32, access: u32) -> Self {
        Self((device_type << 16) | (access << 14) | (function << 2) | method)
    }

    pub const fn code(self) -> u32 {
        self.0
    }

    pub const fn function(self) -> u32 {
        (self.0 >> 2) & 0xFFF
    }
}

pub const GET_REFCOUNT: IoControlCode =
    IoControlCode::new(DEVICE_TYPE, FN_GET_REFCOUNT, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const READ_MSR: IoControlCode =
    IoControlCode::new(DEVICE_TYPE, FN_READ_MSR, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const WRITE_MSR: IoControlCode =
    IoControlCode::new(DEVICE_TYPE, FN_WRITE_MSR, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const READ_IO_PORT_BYTE: IoControlCode =
    IoControlCode::new(DEVICE_TYPE, FN_READ_IO_PORT_BYTE, METHOD_BUFFERED, FILE_READ_ACCESS);
pub const WRITE_IO_PORT_BYTE: IoControlCode =
    IoControlCode::new(DEVICE_TYPE, FN_WRITE_IO_PORT_BYTE, METHOD_BUFFERED, FILE_WRITE_ACCESS);
pub const READ_PCI_CONFIG: IoControlCode =
    IoControlCode::new(DEVICE_TYPE, FN_READ_PCI_CONFIG, METHOD_BUFFERED, FILE_READ_ACCESS);
pub const WRITE_PCI_CONFIG: IoControlCode =
    IoControlCode::new(DEVICE_TYPE, FN_WRITE_PCI_CONFIG, METHOD_BUFFERED, FILE_WRITE_ACCESS);
pub const READ_MEMORY: IoControlCode =
    IoControlCode::new(DEVICE_TYPE, FN_READ_MEMORY, METHOD_BUFFERED, FILE_READ_ACCESS);

/// Plain fixed-size data that may cross the driver boundary as bytes.
///
/// # Safety
///
/// Implementors must be `Copy`, contain no padding bytes, no pointers or
/// references, and every bit pattern (including all zeros) must be a valid
/// value.
pub unsafe trait IoBuffer: Copy + 'static {
    fn zeroed() -> Self {
        // SAFETY: guaranteed by the trait contract.
        unsafe { std::mem::zeroed() }
    }
}

macro_rules! io_buffer_primitives {
    ($($t:ty),*) => {
        $(
            // SAFETY: integer primitives have no padding and no invalid bit patterns.
            unsafe impl IoBuffer for $t {}
        )*
    };
}

io_buffer_primitives!(u8, u16, u32, u64, i8, i16, i32, i64);

// SAFETY: arrays of padding-free plain data are themselves padding-free plain data.
unsafe impl<T: IoBuffer, const N: usize> IoBuffer for [T; N] {}

pub fn bytes_of<T: IoBuffer>(value: &T) -> &[u8] {
    // SAFETY: T has no padding (IoBuffer contract) so every byte is initialised.
    unsafe { slice::from_raw_parts((value as *const T).cast::<u8>(), size_of::<T>()) }
}

pub fn bytes_of_mut<T: IoBuffer>(value: &mut T) -> &mut [u8] {
    // SAFETY: any byte pattern written is a valid T (IoBuffer contract).
    unsafe { slice::from_raw_parts_mut((value as *mut T).cast::<u8>(), size_of::<T>()) }
}

pub fn slice_bytes_mut<T: IoBuffer>(values: &mut [T]) -> &mut [u8] {
    let len = std::mem::size_of_val(values);
    // SAFETY: as bytes_of_mut, over a contiguous run of T.
    unsafe { slice::from_raw_parts_mut(values.as_mut_ptr().cast::<u8>(), len) }
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(4))]
pub struct WriteMsrInput {
    pub register: u32,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(1))]
pub struct WriteIoPortInput {
    pub port: u32,
    pub value: u8,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(4))]
pub struct ReadPciConfigInput {
    pub pci_address: u32,
    pub register: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(4))]
pub struct WritePciConfigInput {
    pub pci_address: u32,
    pub register: u32,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed(4))]
pub struct ReadMemoryInput {
    pub address: u64,
    pub unit_size: u32,
    pub count: u32,
}

const_assert_eq!(size_of::<WriteMsrInput>(), 12);
const_assert_eq!(size_of::<WriteIoPortInput>(), 5);
const_assert_eq!(size_of::<ReadPciConfigInput>(), 8);
const_assert_eq!(size_of::<WritePciConfigInput>(), 12);
const_assert_eq!(size_of::<ReadMemoryInput>(), 16);

// SAFETY: packed, integer-only fields; no padding, all bit patterns valid.
unsafe impl IoBuffer for WriteMsrInput {}
// SAFETY: as above.
unsafe impl IoBuffer for WriteIoPortInput {}
// SAFETY: as above.
unsafe impl IoBuffer for ReadPciConfigInput {}
// SAFETY: as above.
unsafe impl IoBuffer for WritePciConfigInput {}
// SAFETY: as above.
unsafe impl IoBuffer for ReadMemoryInput {}
