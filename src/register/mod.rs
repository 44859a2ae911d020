// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration space register access.
//!
//! The harness never talks to hardware directly; it goes through a
//! [`RegisterAccess`] implementation. Every failure, including a timeout, is
//! reported as a [`RegisterError`] and treated by callers as "register
//! unavailable".

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::pcie::Bdf;

mod memory;
#[cfg(target_os = "illumos")]
mod pcitool;
#[cfg(unix)]
mod sysfs;
mod timed;

pub use memory::{MemoryConfigSpace, TrainingBehavior};
#[cfg(target_os = "illumos")]
pub use pcitool::PcitoolConfigSpace;
#[cfg(unix)]
pub use sysfs::SysfsConfigSpace;
pub use timed::TimedRegisterAccess;

/// Size of PCIe extended configuration space.
pub const PCIE_CONFIGURATION_SPACE_SIZE: u16 = 4096;

/// Linux per-device sysfs directory.
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Default per-call timeout applied by [`TimedRegisterAccess`].
pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("register access unavailable: {0}")]
    Unavailable(String),

    #[error("register access timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration space I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("offset {offset:#x} is outside configuration space")]
    OutOfRange { offset: u16 },

    #[error("offset {offset:#x} is not aligned for a {width} access")]
    Misaligned { offset: u16, width: Width },

    #[error("device {0} is not present")]
    NoDevice(Bdf),
}

/// Width of a single configuration space access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    pub fn bytes(&self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
        }
    }

    pub fn mask(&self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }

    /// Check that an access of this width at `offset` is in range and
    /// naturally aligned.
    pub fn check(&self, offset: u16) -> Result<(), RegisterError> {
        let bytes = self.bytes() as u32;
        if u32::from(offset) + bytes > u32::from(PCIE_CONFIGURATION_SPACE_SIZE) {
            return Err(RegisterError::OutOfRange { offset });
        }
        if u32::from(offset) % bytes != 0 {
            return Err(RegisterError::Misaligned {
                offset,
                width: *self,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}

/// Read and write access to PCI configuration space.
pub trait RegisterAccess: Send + Sync {
    fn read_config(&self, bdf: &Bdf, offset: u16, width: Width) -> Result<u32, RegisterError>;

    fn write_config(
        &self,
        bdf: &Bdf,
        offset: u16,
        width: Width,
        value: u32,
    ) -> Result<(), RegisterError>;

    /// Check that the backend can be used at all. Sessions refuse to start
    /// when this fails.
    fn probe(&self) -> Result<(), RegisterError> {
        Ok(())
    }
}

/// Trait used to read fixed-size words from a `Bdf`.
pub trait DataWord: Sized + Copy + fmt::LowerHex {
    fn width() -> Width;
    fn from_raw(_: u32) -> Self;
    fn to_raw(self) -> u32;
}

impl DataWord for u8 {
    fn width() -> Width {
        Width::Byte
    }

    fn from_raw(data: u32) -> Self {
        (data & 0xFF) as u8
    }

    fn to_raw(self) -> u32 {
        self as _
    }
}

impl DataWord for u16 {
    fn width() -> Width {
        Width::Word
    }

    fn from_raw(data: u32) -> Self {
        (data & 0xFFFF) as u16
    }

    fn to_raw(self) -> u32 {
        self as _
    }
}

impl DataWord for u32 {
    fn width() -> Width {
        Width::Dword
    }

    fn from_raw(data: u32) -> Self {
        data
    }

    fn to_raw(self) -> u32 {
        self
    }
}

pub fn read_configuration_space<W>(
    access: &dyn RegisterAccess,
    bdf: &Bdf,
    offset: u16,
) -> Result<W, RegisterError>
where
    W: DataWord,
{
    access
        .read_config(bdf, offset, W::width())
        .map(W::from_raw)
}

pub fn write_configuration_space<W>(
    access: &dyn RegisterAccess,
    bdf: &Bdf,
    offset: u16,
    word: W,
) -> Result<(), RegisterError>
where
    W: DataWord,
{
    access.write_config(bdf, offset, W::width(), word.to_raw())
}
