// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic system snapshots taken while a session runs.

use bytes::BufMut;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;

use super::push_unique;
use crate::error::Error;
use crate::kernel_log::{classify, mentions, KernelLine, LogQuery};
use crate::pcie::{Bdf, LinkStatus};
use crate::register::{read_configuration_space, RegisterAccess, RegisterError};
use crate::topology::DeviceHandle;

/// Bytes of the type 0/1 common configuration header.
pub const CONFIG_HEADER_SIZE: usize = 64;

/// The decoded start of a function's configuration header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfigHeader {
    pub vendor_id: u16,
    pub device_id: u16,
    pub command: u16,
    pub status: u16,
    pub revision: u8,
    pub class_code: u32,
    pub cache_line_size: u8,
    pub latency_timer: u8,
    pub header_type: u8,
    pub bist: u8,
}

impl TryFrom<&[u8]> for ConfigHeader {
    type Error = Error;

    fn try_from(mut buf: &[u8]) -> Result<Self, Self::Error> {
        use bytes::Buf;
        if buf.len() < 16 {
            return Err(Error::InvalidPcieParameter {
                parameter: "config-header-length",
                value: buf.len() as u64,
            });
        }
        let vendor_id = buf.get_u16_le();
        let device_id = buf.get_u16_le();
        let command = buf.get_u16_le();
        let status = buf.get_u16_le();
        let revision = buf.get_u8();
        let prog_if = buf.get_u8();
        let subclass = buf.get_u8();
        let base = buf.get_u8();
        Ok(ConfigHeader {
            vendor_id,
            device_id,
            command,
            status,
            revision,
            class_code: (u32::from(base) << 16) | (u32::from(subclass) << 8) | u32::from(prog_if),
            cache_line_size: buf.get_u8(),
            latency_timer: buf.get_u8(),
            header_type: buf.get_u8(),
            bist: buf.get_u8(),
        })
    }
}

fn read_header_bytes(access: &dyn RegisterAccess, bdf: &Bdf) -> Result<Vec<u8>, RegisterError> {
    let mut buf = Vec::with_capacity(CONFIG_HEADER_SIZE);
    for offset in (0..CONFIG_HEADER_SIZE as u16).step_by(4) {
        buf.put_u32_le(read_configuration_space::<u32>(access, bdf, offset)?);
    }
    Ok(buf)
}

/// Link attributes the kernel exports per device.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SysfsLink {
    pub current_link_speed: Option<String>,
    pub current_link_width: Option<u8>,
    pub max_link_speed: Option<String>,
    pub max_link_width: Option<u8>,
}

fn read_attribute(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `"16.0 GT/s PCIe"` -> 16.0
fn speed_gts(text: &str) -> Option<f32> {
    text.split_whitespace().next()?.parse().ok()
}

impl SysfsLink {
    pub fn read(root: &Path, bdf: &Bdf) -> Self {
        let dir = root.join(bdf.to_string());
        let width = |name| read_attribute(&dir, name).and_then(|w| w.parse().ok());
        Self {
            current_link_speed: read_attribute(&dir, "current_link_speed"),
            current_link_width: width("current_link_width"),
            max_link_speed: read_attribute(&dir, "max_link_speed"),
            max_link_width: width("max_link_width"),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Current speed or width fell below `baseline`'s.
    pub fn degraded_from(&self, baseline: &SysfsLink) -> bool {
        let width_drop = matches!(
            (self.current_link_width, baseline.current_link_width),
            (Some(now), Some(then)) if now < then
        );
        let speed = |l: &SysfsLink| l.current_link_speed.as_deref().and_then(speed_gts);
        let speed_drop = matches!(
            (speed(self), speed(baseline)),
            (Some(now), Some(then)) if now < then
        );
        width_drop || speed_drop
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub bdf: Bdf,
    pub header: Option<ConfigHeader>,
    pub link_status: Option<LinkStatus>,
    pub sysfs: SysfsLink,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Recent link-related kernel lines naming a target.
    pub kernel_log: Vec<KernelLine>,
    pub devices: Vec<DeviceSnapshot>,
}

/// Takes snapshots of the session's targets.
pub struct SnapshotCollector<'a> {
    pub access: &'a dyn RegisterAccess,
    pub logs: &'a dyn LogQuery,
    pub sysfs_root: &'a Path,
    pub excerpt_lines: usize,
    pub since: DateTime<Utc>,
}

impl SnapshotCollector<'_> {
    pub fn take(&self, targets: &[DeviceHandle], warnings: &mut Vec<String>) -> SystemSnapshot {
        let kernel_log = match self.logs.recent_kernel_lines(Some(self.since)) {
            Ok(lines) => {
                let mut relevant: Vec<KernelLine> = lines
                    .into_iter()
                    .filter(|l| classify(&l.text).is_some())
                    .filter(|l| {
                        targets.iter().any(|t| {
                            mentions(&l.text, &t.bdf)
                                || t.upstream.map_or(false, |u| mentions(&l.text, &u))
                        })
                    })
                    .collect();
                let excess = relevant.len().saturating_sub(self.excerpt_lines);
                relevant.drain(..excess);
                relevant
            }
            Err(e) => {
                tracing::debug!("kernel log unavailable for snapshot: {e}");
                push_unique(warnings, format!("kernel log unavailable for snapshots: {e}"));
                Vec::new()
            }
        };

        let devices = targets
            .iter()
            .map(|t| {
                let header = match read_header_bytes(self.access, &t.bdf) {
                    Ok(bytes) => ConfigHeader::try_from(bytes.as_slice()).ok(),
                    Err(e) => {
                        tracing::debug!(device = %t.bdf, "config header unreadable: {e}");
                        push_unique(
                            warnings,
                            format!("config header of {} unreadable: {e}", t.bdf),
                        );
                        None
                    }
                };
                let link_status = t.pcie_cap.and_then(|cap| {
                    read_configuration_space::<u16>(
                        self.access,
                        &t.bdf,
                        cap + LinkStatus::REGISTER_OFFSET,
                    )
                    .ok()
                    .map(LinkStatus::from)
                });
                DeviceSnapshot {
                    bdf: t.bdf,
                    header,
                    link_status,
                    sysfs: SysfsLink::read(self.sysfs_root, &t.bdf),
                }
            })
            .collect();

        SystemSnapshot {
            timestamp: Utc::now(),
            kernel_log,
            devices,
        }
    }
}

fn describe(status: &LinkStatus) -> String {
    let speed = status.speed.map_or("?".to_string(), |s| s.to_string());
    let width = status.width.map_or("x?".to_string(), |w| w.to_string());
    format!("{speed} {width}")
}

/// Devices whose negotiated link in `current` is below `baseline`.
pub fn degraded_links(baseline: &SystemSnapshot, current: &SystemSnapshot) -> Vec<(Bdf, String)> {
    current
        .devices
        .iter()
        .filter_map(|now| {
            let then = baseline.devices.iter().find(|d| d.bdf == now.bdf)?;
            match (now.link_status, then.link_status) {
                (Some(a), Some(b)) if !a.at_least(&b) => Some((
                    now.bdf,
                    format!("link degraded from {} to {}", describe(&b), describe(&a)),
                )),
                _ if now.sysfs.degraded_from(&then.sysfs) => Some((
                    now.bdf,
                    format!(
                        "link degraded from {} x{} to {} x{}",
                        then.sysfs.current_link_speed.as_deref().unwrap_or("?"),
                        then.sysfs.current_link_width.unwrap_or(0),
                        now.sysfs.current_link_speed.as_deref().unwrap_or("?"),
                        now.sysfs.current_link_width.unwrap_or(0),
                    ),
                )),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::MemoryConfigSpace;

    #[test]
    fn header_decodes() {
        let space = MemoryConfigSpace::new();
        let bdf = Bdf::new(0, 3, 0, 0);
        space.set_u32(bdf, 0x00, 0xa80a_144d);
        space.set_u32(bdf, 0x04, 0x0010_0406);
        space.set_u32(bdf, 0x08, 0x0108_0200);
        space.set_u8(bdf, 0x0E, 0x00);
        let bytes = read_header_bytes(&space, &bdf).unwrap();
        assert_eq!(bytes.len(), CONFIG_HEADER_SIZE);
        let header = ConfigHeader::try_from(bytes.as_slice()).unwrap();
        assert_eq!(header.vendor_id, 0x144d);
        assert_eq!(header.device_id, 0xa80a);
        assert_eq!(header.command, 0x0406);
        assert_eq!(header.status, 0x0010);
        assert_eq!(header.class_code, 0x010802);
        assert!(ConfigHeader::try_from(&bytes[..8]).is_err());
    }

    #[test]
    fn sysfs_speed_drop_detected() {
        let dir = tempfile::tempdir().unwrap();
        let bdf = Bdf::new(0, 3, 0, 0);
        let dev = dir.path().join(bdf.to_string());
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("current_link_speed"), "16.0 GT/s PCIe\n").unwrap();
        fs::write(dev.join("current_link_width"), "4\n").unwrap();
        let before = SysfsLink::read(dir.path(), &bdf);
        fs::write(dev.join("current_link_speed"), "8.0 GT/s PCIe\n").unwrap();
        let after = SysfsLink::read(dir.path(), &bdf);
        assert_eq!(before.current_link_width, Some(4));
        assert!(after.degraded_from(&before));
        assert!(!before.degraded_from(&after));
        assert!(SysfsLink::read(dir.path(), &Bdf::new(0, 9, 0, 0)).is_empty());
    }

    #[test]
    fn register_width_drop_detected() {
        let snapshot = |raw: u16| SystemSnapshot {
            timestamp: Utc::now(),
            kernel_log: Vec::new(),
            devices: vec![DeviceSnapshot {
                bdf: Bdf::new(0, 3, 0, 0),
                header: None,
                link_status: Some(LinkStatus::from(raw)),
                sysfs: SysfsLink::default(),
            }],
        };
        // Gen4 x4, then Gen4 x2.
        let drops = degraded_links(&snapshot(0x2044), &snapshot(0x2024));
        assert_eq!(drops.len(), 1);
        assert!(drops[0].1.contains("x4"));
        assert!(degraded_links(&snapshot(0x2044), &snapshot(0x2044)).is_empty());
    }
}
