// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI configuration space layout: addresses, capability headers, and the
//! PCI Express Link and Device registers the harness reads and writes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::convert::TryFrom;
use std::fmt;

use crate::error::Error;
use crate::register::{read_configuration_space, RegisterAccess};

pub const PCIE_VENDOR_ID_OFFSET: u16 = 0x00;
pub const PCIE_DEVICE_ID_OFFSET: u16 = 0x02;
pub const PCIE_COMMAND_OFFSET: u16 = 0x04;
pub const PCIE_STATUS_OFFSET: u16 = 0x06;
pub const PCIE_CLASS_REVISION_OFFSET: u16 = 0x08;
pub const PCIE_HEADER_TYPE_OFFSET: u16 = 0x0E;

// Type 1 (bridge) header bus numbers.
pub const PCIE_SECONDARY_BUS_OFFSET: u16 = 0x19;
pub const PCIE_SUBORDINATE_BUS_OFFSET: u16 = 0x1A;

// Offset of the Capabilities Pointer register, within the standard
// configuration header.
pub const PCIE_CAP_POINTER: u16 = 0x34;

/// Upper bound on capability list hops. A malformed list can loop; 48 nodes
/// is the most that fit in the 192 bytes above the standard header.
pub const MAX_CAPABILITY_HOPS: usize = 48;

/// Vendor ID read back from a function that is absent or not responding.
pub const INVALID_VENDOR_ID: u16 = 0xFFFF;

/// A PCIe Bus/Device/Function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bdf {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl Bdf {
    pub const fn new(domain: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl std::str::FromStr for Bdf {
    type Err = Error;

    /// Accepts `bus/device/function` in decimal, or the hex forms
    /// `BB:DD.F` and `DDDD:BB:DD.F`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidBdf(s.to_string());
        let s = s.trim();
        if s.contains('/') {
            let parts = s.splitn(3, '/').collect::<Vec<_>>();
            if parts.len() != 3 {
                return Err(invalid());
            }
            let bus = parts[0].parse().map_err(|_| invalid())?;
            let device: u8 = parts[1].parse().map_err(|_| invalid())?;
            let function: u8 = parts[2].parse().map_err(|_| invalid())?;
            if device > 31 || function > 7 {
                return Err(invalid());
            }
            return Ok(Bdf::new(0, bus, device, function));
        }

        let (head, function) = s.rsplit_once('.').ok_or_else(invalid)?;
        let function = u8::from_str_radix(function, 16).map_err(|_| invalid())?;
        let parts = head.split(':').collect::<Vec<_>>();
        let (domain, bus, device) = match parts.as_slice() {
            [bus, device] => (0, *bus, *device),
            [domain, bus, device] => (
                u16::from_str_radix(domain, 16).map_err(|_| invalid())?,
                *bus,
                *device,
            ),
            _ => return Err(invalid()),
        };
        let bus = u8::from_str_radix(bus, 16).map_err(|_| invalid())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| invalid())?;
        if device > 31 || function > 7 {
            return Err(invalid());
        }
        Ok(Bdf::new(domain, bus, device, function))
    }
}

impl Serialize for Bdf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Bdf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A PCI Capability ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityId {
    PowerManagement,
    Pcie,
    Other(u8),
}

impl From<u8> for CapabilityId {
    fn from(x: u8) -> Self {
        match x {
            0x01 => CapabilityId::PowerManagement,
            0x10 => CapabilityId::Pcie,
            _ => CapabilityId::Other(x),
        }
    }
}

/// Represents a single capability list node header.
#[derive(Debug, Clone, Copy)]
pub struct PcieCapabilityHeader {
    pub id: CapabilityId,
    pub next: u8,
}

impl From<u16> for PcieCapabilityHeader {
    fn from(word: u16) -> Self {
        let id = CapabilityId::from((word & 0xFF) as u8);
        let next = (word >> 8) as u8;
        Self { id, next }
    }
}

/// Walk the capability list of `bdf` looking for `id`, returning its offset.
///
/// A failed read, an exhausted list, or a list longer than
/// [`MAX_CAPABILITY_HOPS`] all yield `None`; callers skip the device.
pub fn find_capability(access: &dyn RegisterAccess, bdf: &Bdf, id: CapabilityId) -> Option<u16> {
    let mut cap_start = match read_configuration_space::<u8>(access, bdf, PCIE_CAP_POINTER) {
        Ok(ptr) => u16::from(ptr & 0xFC),
        Err(e) => {
            tracing::debug!(device = %bdf, error = %e, "capability pointer unreadable");
            return None;
        }
    };
    for _ in 0..MAX_CAPABILITY_HOPS {
        if cap_start == 0 {
            return None;
        }
        let word = match read_configuration_space::<u16>(access, bdf, cap_start) {
            Ok(word) => word,
            Err(e) => {
                tracing::debug!(device = %bdf, offset = cap_start, error = %e, "capability header unreadable");
                return None;
            }
        };
        let cap = PcieCapabilityHeader::from(word);
        if cap.id == id {
            return Some(cap_start);
        }
        cap_start = u16::from(cap.next & 0xFC);
    }
    tracing::debug!(device = %bdf, "capability list exceeded hop limit");
    None
}

/// Locate the PCI Express capability structure.
pub fn find_pcie_capability(access: &dyn RegisterAccess, bdf: &Bdf) -> Option<u16> {
    find_capability(access, bdf, CapabilityId::Pcie)
}

/// The width of a PCIe link
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct LinkWidth(u8);

impl From<LinkWidth> for u8 {
    fn from(w: LinkWidth) -> u8 {
        w.0
    }
}

impl fmt::Display for LinkWidth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

impl TryFrom<u8> for LinkWidth {
    type Error = Error;

    fn try_from(w: u8) -> Result<Self, Self::Error> {
        const MASK: u8 = 0x3F;
        match w & MASK {
            0b00_0001 => Ok(LinkWidth(1)),
            0b00_0010 => Ok(LinkWidth(2)),
            0b00_0100 => Ok(LinkWidth(4)),
            0b00_1000 => Ok(LinkWidth(8)),
            0b00_1100 => Ok(LinkWidth(12)),
            0b01_0000 => Ok(LinkWidth(16)),
            0b10_0000 => Ok(LinkWidth(32)),
            _ => Err(Error::InvalidPcieParameter {
                parameter: "link-width",
                value: w.into(),
            }),
        }
    }
}

/// Speed of a PCIe link, in GT/s.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct LinkSpeed(f32);

impl LinkSpeed {
    pub fn gt_per_second(&self) -> f32 {
        self.0
    }
}

impl fmt::Display for LinkSpeed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}GT/s", self.0)
    }
}

impl TryFrom<u8> for LinkSpeed {
    type Error = Error;

    fn try_from(word: u8) -> Result<Self, Self::Error> {
        const MASK: u8 = 0x0F;
        match word & MASK {
            0b0001 => Ok(LinkSpeed(2.5)),
            0b0010 => Ok(LinkSpeed(5.0)),
            0b0011 => Ok(LinkSpeed(8.0)),
            0b0100 => Ok(LinkSpeed(16.0)),
            0b0101 => Ok(LinkSpeed(32.0)),
            0b0110 => Ok(LinkSpeed(64.0)),
            _ => Err(Error::InvalidPcieParameter {
                parameter: "link-speed",
                value: word.into(),
            }),
        }
    }
}

/// The PCIe Link Status Register
///
/// Decoding never fails: fields that do not hold a defined encoding (link
/// down, or a device mid-training) come back as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinkStatus {
    pub raw: u16,
    pub speed: Option<LinkSpeed>,
    pub width: Option<LinkWidth>,
    pub training: bool,
    pub active: bool,
}

impl LinkStatus {
    pub const REGISTER_OFFSET: u16 = 0x12;
    pub const LINK_TRAINING: u16 = 1 << 11;
    pub const DLL_LINK_ACTIVE: u16 = 1 << 13;

    /// True when this status reports at least the speed and width of
    /// `baseline`.
    pub fn at_least(&self, baseline: &LinkStatus) -> bool {
        let speed_ok = match (self.speed, baseline.speed) {
            (Some(now), Some(then)) => now >= then,
            (None, Some(_)) => false,
            _ => true,
        };
        let width_ok = match (self.width, baseline.width) {
            (Some(now), Some(then)) => now >= then,
            (None, Some(_)) => false,
            _ => true,
        };
        speed_ok && width_ok
    }
}

impl From<u16> for LinkStatus {
    fn from(word: u16) -> Self {
        let speed = LinkSpeed::try_from(word as u8).ok();
        let width = LinkWidth::try_from((word >> 4) as u8).ok();
        let training = (word & Self::LINK_TRAINING) != 0;
        let active = (word & Self::DLL_LINK_ACTIVE) != 0;
        Self {
            raw: word,
            speed,
            width,
            training,
            active,
        }
    }
}

/// The PCIe Link Control Register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkControl(pub u16);

impl LinkControl {
    pub const REGISTER_OFFSET: u16 = 0x10;
    pub const RETRAIN_LINK: u16 = 1 << 5;

    pub fn with_retrain(self) -> Self {
        Self(self.0 | Self::RETRAIN_LINK)
    }

    pub fn retrain_requested(&self) -> bool {
        (self.0 & Self::RETRAIN_LINK) != 0
    }
}

/// The PCIe Device Capabilities Register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities(pub u32);

impl DeviceCapabilities {
    pub const REGISTER_OFFSET: u16 = 0x04;
    pub const FLR_CAPABLE: u32 = 1 << 28;

    pub fn flr_capable(&self) -> bool {
        (self.0 & Self::FLR_CAPABLE) != 0
    }
}

/// The PCIe Device Control Register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceControl(pub u16);

impl DeviceControl {
    pub const REGISTER_OFFSET: u16 = 0x08;
    pub const INITIATE_FLR: u16 = 1 << 15;

    pub fn with_flr(self) -> Self {
        Self(self.0 | Self::INITIATE_FLR)
    }
}

/// Device power state, as held in the PM Control/Status Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PowerState {
    D0,
    D1,
    D2,
    D3Hot,
}

impl From<u16> for PowerState {
    fn from(word: u16) -> Self {
        match word & 0b11 {
            0b00 => PowerState::D0,
            0b01 => PowerState::D1,
            0b10 => PowerState::D2,
            _ => PowerState::D3Hot,
        }
    }
}

impl From<PowerState> for u16 {
    fn from(state: PowerState) -> u16 {
        match state {
            PowerState::D0 => 0b00,
            PowerState::D1 => 0b01,
            PowerState::D2 => 0b10,
            PowerState::D3Hot => 0b11,
        }
    }
}

/// The PM Control/Status Register, relative to the PM capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerControl(pub u16);

impl PowerControl {
    pub const REGISTER_OFFSET: u16 = 0x04;

    pub fn state(&self) -> PowerState {
        PowerState::from(self.0)
    }

    pub fn with_state(self, state: PowerState) -> Self {
        Self((self.0 & !0b11) | u16::from(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::MemoryConfigSpace;

    #[test]
    fn training_bit_tracks_bit_11_only() {
        for raw in 0..=u16::MAX {
            let status = LinkStatus::from(raw);
            assert_eq!(status.training, (raw >> 11) & 1 == 1, "raw {raw:#06x}");
        }
    }

    #[test]
    fn decodes_gen4_x4_active_link() {
        let status = LinkStatus::from(0x2044);
        assert_eq!(status.speed, Some(LinkSpeed(16.0)));
        assert_eq!(status.width, Some(LinkWidth(4)));
        assert!(status.active);
        assert!(!status.training);
    }

    #[test]
    fn narrower_link_is_not_at_least_baseline() {
        let x4 = LinkStatus::from(0x2044);
        let x2 = LinkStatus::from(0x2024);
        assert!(x4.at_least(&x2));
        assert!(!x2.at_least(&x4));
    }

    #[test]
    fn parses_every_bdf_syntax() {
        let expected = Bdf::new(0, 3, 0, 1);
        assert_eq!("3/0/1".parse::<Bdf>().unwrap(), expected);
        assert_eq!("03:00.1".parse::<Bdf>().unwrap(), expected);
        assert_eq!("0000:03:00.1".parse::<Bdf>().unwrap(), expected);
        assert_eq!(expected.to_string(), "0000:03:00.1");
        assert!("03:20.0".parse::<Bdf>().is_err());
        assert!("nonsense".parse::<Bdf>().is_err());
    }

    #[test]
    fn locates_pcie_capability_after_other_nodes() {
        let bdf = Bdf::new(0, 3, 0, 0);
        let space = MemoryConfigSpace::new();
        space.add_device(bdf);
        space.set_u8(bdf, PCIE_CAP_POINTER, 0x40);
        space.set_u16(bdf, 0x40, 0x5001); // PM, next 0x50
        space.set_u16(bdf, 0x50, 0x7005); // MSI, next 0x70
        space.set_u16(bdf, 0x70, 0x0010); // PCIe, end
        assert_eq!(find_pcie_capability(&space, &bdf), Some(0x70));
        assert_eq!(
            find_capability(&space, &bdf, CapabilityId::PowerManagement),
            Some(0x40)
        );
    }

    #[test]
    fn capability_cycle_is_not_found() {
        let bdf = Bdf::new(0, 3, 0, 0);
        let space = MemoryConfigSpace::new();
        space.add_device(bdf);
        space.set_u8(bdf, PCIE_CAP_POINTER, 0x40);
        space.set_u16(bdf, 0x40, 0x5005);
        space.set_u16(bdf, 0x50, 0x4005);
        assert_eq!(find_pcie_capability(&space, &bdf), None);
    }

    #[test]
    fn unreadable_device_is_not_found() {
        let bdf = Bdf::new(0, 3, 0, 0);
        let space = MemoryConfigSpace::new();
        assert_eq!(find_pcie_capability(&space, &bdf), None);
    }

    #[test]
    fn power_control_preserves_upper_bits() {
        let pmcsr = PowerControl(0x0108).with_state(PowerState::D3Hot);
        assert_eq!(pmcsr.0, 0x010B);
        assert_eq!(pmcsr.state(), PowerState::D3Hot);
    }
}
