// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! illumos configuration space access through the PCI nexus `ioctl(2)`
//! interface.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use super::{RegisterAccess, RegisterError, Width};
use crate::pcie::Bdf;

// Ioctl command definitions
const PCITOOL_IOC: i32 = (('P' as i32) << 24) | (('C' as i32) << 16) | (('T' as i32) << 8);
const PCITOOL_DEVICE_GET_REG: i32 = PCITOOL_IOC | 1;
const PCITOOL_DEVICE_SET_REG: i32 = PCITOOL_IOC | 2;
const PCI_REG_DEVICE_FILE: &str = "/devices/pci@0,0:reg";
#[cfg(target_endian = "little")]
const PCI_ATTR_ENDIANNESS: u32 = 0x0;
#[cfg(not(target_endian = "little"))]
const PCI_ATTR_ENDIANNESS: u32 = 0x100;

// BAR number selecting configuration space.
const BAR_CONFIGURATION: u8 = 0;

/// The `PciRegister` is the struct passed to the nexus driver to read or
/// write one configuration space register.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
struct PciRegister {
    user_version: u16,
    driver_version: u16,
    bus_no: u8,
    dev_no: u8,
    func_no: u8,
    barnum: u8,
    offset: u64,
    acc_attr: u32,
    _padding1: u32,
    data: u64,
    status: u32,
    _padding2: u32,
    phys_addr: u64,
}

fn size_attribute(width: Width) -> u32 {
    match width {
        Width::Byte => 0x0,
        Width::Word => 0x1,
        Width::Dword => 0x2,
    }
}

#[derive(Debug)]
pub struct PcitoolConfigSpace {
    file: File,
}

impl PcitoolConfigSpace {
    pub fn open() -> Result<Self, RegisterError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(PCI_REG_DEVICE_FILE)?;
        Ok(Self { file })
    }

    fn register(bdf: &Bdf, offset: u16, width: Width) -> Result<PciRegister, RegisterError> {
        // The nexus node addresses a single segment.
        if bdf.domain != 0 {
            return Err(RegisterError::NoDevice(*bdf));
        }
        width.check(offset)?;
        Ok(PciRegister {
            user_version: 0x01,
            bus_no: bdf.bus,
            dev_no: bdf.device,
            func_no: bdf.function,
            barnum: BAR_CONFIGURATION,
            offset: u64::from(offset),
            acc_attr: PCI_ATTR_ENDIANNESS | size_attribute(width),
            ..Default::default()
        })
    }

    fn ioctl(&self, cmd: i32, register: &mut PciRegister) -> Result<(), RegisterError> {
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                cmd,
                register as *mut _ as *mut libc::c_void,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error().into())
        }
    }
}

impl RegisterAccess for PcitoolConfigSpace {
    fn read_config(&self, bdf: &Bdf, offset: u16, width: Width) -> Result<u32, RegisterError> {
        let mut register = Self::register(bdf, offset, width)?;
        self.ioctl(PCITOOL_DEVICE_GET_REG, &mut register)?;
        Ok((register.data as u32) & width.mask())
    }

    fn write_config(
        &self,
        bdf: &Bdf,
        offset: u16,
        width: Width,
        value: u32,
    ) -> Result<(), RegisterError> {
        let mut register = Self::register(bdf, offset, width)?;
        register.data = u64::from(value & width.mask());
        self.ioctl(PCITOOL_DEVICE_SET_REG, &mut register)
    }
}
