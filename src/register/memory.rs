// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory configuration space, for dry runs and tests.
//!
//! Each device gets a zeroed 4KiB space. Link training can be scripted so
//! that setting Retrain Link in Link Control makes the Link Training bit read
//! as set for a number of Link Status reads.

use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::{RegisterAccess, RegisterError, Width, PCIE_CONFIGURATION_SPACE_SIZE};
use crate::pcie::{Bdf, DeviceControl, LinkControl, LinkStatus};

/// How a scripted device responds to a Retrain Link request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingBehavior {
    /// Link Training reads as set for this many Link Status reads, then
    /// clears.
    Completes { training_reads: u32 },
    /// Link Training never clears.
    Stuck,
    /// The request is accepted but Link Training is never observed.
    Silent,
}

#[derive(Debug)]
struct DeviceSpace {
    bytes: Vec<u8>,
    fail_reads: bool,
    fail_writes: bool,
    pcie_cap: Option<u16>,
    behavior: Option<TrainingBehavior>,
    // `Some(None)` trains forever.
    training: Option<Option<u32>>,
}

impl DeviceSpace {
    fn new() -> Self {
        Self {
            bytes: vec![0; usize::from(PCIE_CONFIGURATION_SPACE_SIZE)],
            fail_reads: false,
            fail_writes: false,
            pcie_cap: None,
            behavior: None,
            training: None,
        }
    }

    fn load(&self, offset: u16, width: Width) -> u32 {
        let start = usize::from(offset);
        let mut buf = [0u8; 4];
        buf[..width.bytes()].copy_from_slice(&self.bytes[start..start + width.bytes()]);
        u32::from_le_bytes(buf)
    }

    fn store(&mut self, offset: u16, width: Width, value: u32) {
        let start = usize::from(offset);
        let buf = value.to_le_bytes();
        self.bytes[start..start + width.bytes()].copy_from_slice(&buf[..width.bytes()]);
    }

    fn set_training_bit(&mut self, set: bool) {
        if let Some(cap) = self.pcie_cap {
            let offset = cap + LinkStatus::REGISTER_OFFSET;
            let mut status = self.load(offset, Width::Word) as u16;
            if set {
                status |= LinkStatus::LINK_TRAINING;
            } else {
                status &= !LinkStatus::LINK_TRAINING;
            }
            self.store(offset, Width::Word, u32::from(status));
        }
    }

    fn read(&mut self, offset: u16, width: Width) -> u32 {
        if let Some(cap) = self.pcie_cap {
            if offset == cap + LinkStatus::REGISTER_OFFSET {
                match self.training {
                    Some(Some(0)) => {
                        self.training = None;
                        self.set_training_bit(false);
                    }
                    Some(Some(left)) => self.training = Some(Some(left - 1)),
                    _ => {}
                }
            }
        }
        self.load(offset, width)
    }

    fn write(&mut self, offset: u16, width: Width, value: u32) {
        let Some(cap) = self.pcie_cap else {
            self.store(offset, width, value);
            return;
        };
        if offset == cap + LinkControl::REGISTER_OFFSET {
            let control = LinkControl(value as u16);
            // Retrain Link always reads back as zero.
            self.store(
                offset,
                width,
                u32::from(control.0 & !LinkControl::RETRAIN_LINK),
            );
            if control.retrain_requested() {
                match self.behavior {
                    Some(TrainingBehavior::Completes { training_reads }) => {
                        self.training = Some(Some(training_reads));
                        self.set_training_bit(true);
                    }
                    Some(TrainingBehavior::Stuck) => {
                        self.training = Some(None);
                        self.set_training_bit(true);
                    }
                    Some(TrainingBehavior::Silent) | None => {}
                }
            }
        } else if offset == cap + DeviceControl::REGISTER_OFFSET {
            // Initiate FLR is self-clearing.
            self.store(
                offset,
                width,
                value & !u32::from(DeviceControl::INITIATE_FLR),
            );
        } else {
            self.store(offset, width, value);
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeMap<Bdf, DeviceSpace>,
    unavailable: Option<String>,
    writes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryConfigSpace {
    inner: Mutex<Inner>,
}

impl MemoryConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, bdf: Bdf) {
        self.inner
            .lock()
            .devices
            .entry(bdf)
            .or_insert_with(DeviceSpace::new);
    }

    pub fn remove_device(&self, bdf: Bdf) {
        self.inner.lock().devices.remove(&bdf);
    }

    fn with_device(&self, bdf: Bdf, f: impl FnOnce(&mut DeviceSpace)) {
        let mut inner = self.inner.lock();
        f(inner.devices.entry(bdf).or_insert_with(DeviceSpace::new));
    }

    pub fn set_u8(&self, bdf: Bdf, offset: u16, value: u8) {
        self.with_device(bdf, |dev| dev.store(offset, Width::Byte, value.into()));
    }

    pub fn set_u16(&self, bdf: Bdf, offset: u16, value: u16) {
        self.with_device(bdf, |dev| dev.store(offset, Width::Word, value.into()));
    }

    pub fn set_u32(&self, bdf: Bdf, offset: u16, value: u32) {
        self.with_device(bdf, |dev| dev.store(offset, Width::Dword, value));
    }

    /// Script the response to Retrain Link for a device whose PCI Express
    /// capability lives at `pcie_cap`.
    pub fn set_training_behavior(&self, bdf: Bdf, pcie_cap: u16, behavior: TrainingBehavior) {
        self.with_device(bdf, |dev| {
            dev.pcie_cap = Some(pcie_cap);
            dev.behavior = Some(behavior);
        });
    }

    pub fn fail_reads(&self, bdf: Bdf, fail: bool) {
        self.with_device(bdf, |dev| dev.fail_reads = fail);
    }

    pub fn fail_writes(&self, bdf: Bdf, fail: bool) {
        self.with_device(bdf, |dev| dev.fail_writes = fail);
    }

    /// Make [`RegisterAccess::probe`] fail with `reason`.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.inner.lock().unavailable = reason.map(String::from);
    }

    /// Number of successful writes performed so far.
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }
}

impl RegisterAccess for MemoryConfigSpace {
    fn read_config(&self, bdf: &Bdf, offset: u16, width: Width) -> Result<u32, RegisterError> {
        width.check(offset)?;
        let mut inner = self.inner.lock();
        let dev = inner
            .devices
            .get_mut(bdf)
            .ok_or(RegisterError::NoDevice(*bdf))?;
        if dev.fail_reads {
            return Err(RegisterError::Unavailable(format!("read of {bdf} failed")));
        }
        Ok(dev.read(offset, width))
    }

    fn write_config(
        &self,
        bdf: &Bdf,
        offset: u16,
        width: Width,
        value: u32,
    ) -> Result<(), RegisterError> {
        width.check(offset)?;
        let mut inner = self.inner.lock();
        let dev = inner
            .devices
            .get_mut(bdf)
            .ok_or(RegisterError::NoDevice(*bdf))?;
        if dev.fail_writes {
            return Err(RegisterError::Unavailable(format!("write to {bdf} failed")));
        }
        dev.write(offset, width, value);
        inner.writes += 1;
        Ok(())
    }

    fn probe(&self) -> Result<(), RegisterError> {
        match &self.inner.lock().unavailable {
            Some(reason) => Err(RegisterError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}
