// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Which devices sit below the switch under test.
//!
//! Every reset the harness issues is gated on [`BusScope::classify`]; a
//! device outside the switch's bus ranges is never touched.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::Error;
use crate::ltssm::LtssmState;
use crate::pcie::{
    find_capability, find_pcie_capability, Bdf, CapabilityId, PCIE_CLASS_REVISION_OFFSET,
    PCIE_DEVICE_ID_OFFSET, PCIE_HEADER_TYPE_OFFSET, PCIE_SECONDARY_BUS_OFFSET,
    PCIE_SUBORDINATE_BUS_OFFSET, PCIE_VENDOR_ID_OFFSET,
};
use crate::register::{read_configuration_space, RegisterAccess, RegisterError};

/// PCI base class for bridges, switch ports included.
pub const PCI_CLASS_BRIDGE: u8 = 0x06;

/// A vendor/device ID pair, written `vvvv:dddd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceSignature {
    pub vendor_id: u16,
    pub device_id: u16,
}

impl DeviceSignature {
    pub const fn new(vendor_id: u16, device_id: u16) -> Self {
        Self {
            vendor_id,
            device_id,
        }
    }
}

/// Broadcom PEX switch families the harness recognizes out of the box.
pub const DEFAULT_SWITCH_SIGNATURES: &[DeviceSignature] = &[
    DeviceSignature::new(0x1000, 0xc010),
    DeviceSignature::new(0x1000, 0xc030),
    DeviceSignature::new(0x1000, 0xc040),
];

impl fmt::Display for DeviceSignature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.device_id)
    }
}

impl std::str::FromStr for DeviceSignature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidSignature(s.to_string());
        let (vendor, device) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hex = |t: &str| {
            let t = t.trim_start_matches("0x").trim_start_matches("0X");
            u16::from_str_radix(t, 16).map_err(|_| invalid())
        };
        Ok(Self::new(hex(vendor)?, hex(device)?))
    }
}

impl Serialize for DeviceSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One row of the device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PciDeviceInfo {
    pub bdf: Bdf,
    pub vendor_id: u16,
    pub device_id: u16,
    /// Base class, subclass and programming interface.
    pub class_code: u32,
    pub header_type: u8,
}

impl PciDeviceInfo {
    /// Build a table row from the device's configuration header.
    pub fn read(access: &dyn RegisterAccess, bdf: Bdf) -> Result<Self, RegisterError> {
        let vendor_id = read_configuration_space::<u16>(access, &bdf, PCIE_VENDOR_ID_OFFSET)?;
        let device_id = read_configuration_space::<u16>(access, &bdf, PCIE_DEVICE_ID_OFFSET)?;
        let class = read_configuration_space::<u32>(access, &bdf, PCIE_CLASS_REVISION_OFFSET)?;
        let header_type = read_configuration_space::<u8>(access, &bdf, PCIE_HEADER_TYPE_OFFSET)?;
        Ok(Self {
            bdf,
            vendor_id,
            device_id,
            class_code: class >> 8,
            header_type,
        })
    }

    pub fn signature(&self) -> DeviceSignature {
        DeviceSignature::new(self.vendor_id, self.device_id)
    }

    pub fn base_class(&self) -> u8 {
        (self.class_code >> 16) as u8
    }

    /// Bridge class, or a type 1 configuration header.
    pub fn is_bridge(&self) -> bool {
        self.base_class() == PCI_CLASS_BRIDGE || (self.header_type & 0x7F) == 0x01
    }
}

fn read_hex_attribute(dir: &Path, name: &str) -> Option<u32> {
    let text = fs::read_to_string(dir.join(name)).ok()?;
    let text = text.trim();
    u32::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}

/// Build the device table from a sysfs `devices` directory. Entries whose
/// attributes cannot be read are skipped.
pub fn discover_sysfs(root: &Path) -> Result<Vec<PciDeviceInfo>, Error> {
    let mut devices = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let Some(bdf) = entry.file_name().to_str().and_then(|n| n.parse::<Bdf>().ok()) else {
            continue;
        };
        let dir = entry.path();
        let (Some(vendor_id), Some(device_id), Some(class_code)) = (
            read_hex_attribute(dir, "vendor"),
            read_hex_attribute(dir, "device"),
            read_hex_attribute(dir, "class"),
        ) else {
            tracing::debug!(device = %bdf, "skipping device with unreadable attributes");
            continue;
        };
        // The first 64 bytes of config are world-readable.
        let header_type = fs::read(dir.join("config"))
            .ok()
            .and_then(|config| config.get(usize::from(PCIE_HEADER_TYPE_OFFSET)).copied())
            .unwrap_or(0);
        devices.push(PciDeviceInfo {
            bdf,
            vendor_id: vendor_id as u16,
            device_id: device_id as u16,
            class_code,
            header_type,
        });
    }
    devices.sort_by_key(|d| d.bdf);
    Ok(devices)
}

/// Build the device table by probing every function on every bus of
/// `domain`, for platforms without a sysfs device tree.
pub fn scan_config_space(access: &dyn RegisterAccess, domain: u16) -> Vec<PciDeviceInfo> {
    let present = |bdf: &Bdf| {
        matches!(
            read_configuration_space::<u16>(access, bdf, PCIE_VENDOR_ID_OFFSET),
            Ok(id) if id != 0xFFFF && id != 0x0000
        )
    };
    let mut devices = Vec::new();
    for bus in 0..=u8::MAX {
        for device in 0..32 {
            let first = Bdf::new(domain, bus, device, 0);
            if !present(&first) {
                continue;
            }
            let multifunction = matches!(
                read_configuration_space::<u8>(access, &first, PCIE_HEADER_TYPE_OFFSET),
                Ok(h) if h & 0x80 != 0
            );
            let functions = if multifunction { 0..8 } else { 0..1 };
            for function in functions {
                let bdf = Bdf::new(domain, bus, device, function);
                if function > 0 && !present(&bdf) {
                    continue;
                }
                match PciDeviceInfo::read(access, bdf) {
                    Ok(info) => devices.push(info),
                    Err(e) => tracing::debug!(device = %bdf, "skipping unreadable function: {e}"),
                }
            }
        }
    }
    devices
}

/// A switch bridge and the bus range behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwitchPort {
    pub bdf: Bdf,
    pub secondary: u8,
    pub subordinate: u8,
}

impl SwitchPort {
    fn contains(&self, bdf: &Bdf) -> bool {
        bdf.domain == self.bdf.domain && (self.secondary..=self.subordinate).contains(&bdf.bus)
    }

    fn span(&self) -> u8 {
        self.subordinate - self.secondary
    }
}

/// Why a device may or may not be tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeDecision {
    InScope,
    OutsideSwitch,
    Bridge,
    SwitchFunction,
}

impl ScopeDecision {
    pub fn reason(&self) -> &'static str {
        match self {
            ScopeDecision::InScope => "downstream endpoint",
            ScopeDecision::OutsideSwitch => "bus is not behind the switch",
            ScopeDecision::Bridge => "device is a bridge or switch port",
            ScopeDecision::SwitchFunction => "device is a function of the switch itself",
        }
    }
}

/// The buses subordinate to the switch, computed once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusScope {
    pub signatures: Vec<DeviceSignature>,
    pub ports: Vec<SwitchPort>,
    buses: BTreeSet<(u16, u8)>,
}

/// Union the `[secondary, subordinate]` ranges of every bridge matching
/// `signatures`. Bridges whose bus registers cannot be read are skipped.
pub fn resolve_scope(
    devices: &[PciDeviceInfo],
    signatures: &[DeviceSignature],
    access: &dyn RegisterAccess,
) -> BusScope {
    let mut ports = Vec::new();
    let mut buses = BTreeSet::new();
    for dev in devices {
        if !dev.is_bridge() || !signatures.contains(&dev.signature()) {
            continue;
        }
        let range = read_configuration_space::<u8>(access, &dev.bdf, PCIE_SECONDARY_BUS_OFFSET)
            .and_then(|secondary| {
                read_configuration_space::<u8>(access, &dev.bdf, PCIE_SUBORDINATE_BUS_OFFSET)
                    .map(|subordinate| (secondary, subordinate))
            });
        let (secondary, subordinate) = match range {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(device = %dev.bdf, "cannot read bridge bus numbers: {e}");
                continue;
            }
        };
        if secondary == 0 || subordinate < secondary {
            tracing::debug!(device = %dev.bdf, secondary, subordinate, "bridge has no usable bus range");
            continue;
        }
        tracing::debug!(device = %dev.bdf, secondary, subordinate, "switch port");
        buses.extend((secondary..=subordinate).map(|bus| (dev.bdf.domain, bus)));
        ports.push(SwitchPort {
            bdf: dev.bdf,
            secondary,
            subordinate,
        });
    }
    BusScope {
        signatures: signatures.to_vec(),
        ports,
        buses,
    }
}

impl BusScope {
    /// True when no matching switch bridge was found.
    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    pub fn buses(&self) -> impl Iterator<Item = (u16, u8)> + '_ {
        self.buses.iter().copied()
    }

    pub fn contains_bus(&self, domain: u16, bus: u8) -> bool {
        self.buses.contains(&(domain, bus))
    }

    pub fn classify(&self, dev: &PciDeviceInfo) -> ScopeDecision {
        if !self.contains_bus(dev.bdf.domain, dev.bdf.bus) {
            ScopeDecision::OutsideSwitch
        } else if dev.is_bridge() {
            ScopeDecision::Bridge
        } else if self.signatures.contains(&dev.signature()) {
            ScopeDecision::SwitchFunction
        } else {
            ScopeDecision::InScope
        }
    }

    /// Every in-scope endpoint of `devices`, in address order.
    pub fn endpoints<'a>(&self, devices: &'a [PciDeviceInfo]) -> Vec<&'a PciDeviceInfo> {
        let mut found: Vec<_> = devices
            .iter()
            .filter(|d| self.classify(d) == ScopeDecision::InScope)
            .collect();
        found.sort_by_key(|d| d.bdf);
        found
    }

    /// The switch port directly above `bdf`: the narrowest range holding it.
    pub fn parent_port(&self, bdf: &Bdf) -> Option<Bdf> {
        self.ports
            .iter()
            .filter(|p| p.contains(bdf) && p.bdf != *bdf)
            .min_by_key(|p| p.span())
            .map(|p| p.bdf)
    }
}

/// A device selected for testing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHandle {
    pub bdf: Bdf,
    pub vendor_id: u16,
    pub device_id: u16,
    /// Offset of the PCI Express capability; `None` if it was not found.
    pub pcie_cap: Option<u16>,
    /// Offset of the Power Management capability.
    pub pm_cap: Option<u16>,
    /// The switch port the device hangs off.
    pub upstream: Option<Bdf>,
    pub last_state: LtssmState,
}

impl DeviceHandle {
    pub fn locate(access: &dyn RegisterAccess, info: &PciDeviceInfo, upstream: Option<Bdf>) -> Self {
        Self {
            bdf: info.bdf,
            vendor_id: info.vendor_id,
            device_id: info.device_id,
            pcie_cap: find_pcie_capability(access, &info.bdf),
            pm_cap: find_capability(access, &info.bdf, CapabilityId::PowerManagement),
            upstream,
            last_state: LtssmState::Unknown,
        }
    }
}
