// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Providers of the current training state, fastest first.

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::{LtssmState, ObservationSource};
use crate::error::Error;
use crate::host::{command_stdout, HostCommandSpec, DEFAULT_COMMAND_TIMEOUT};
use crate::pcie::{Bdf, LinkStatus, INVALID_VENDOR_ID};
use crate::register::{read_configuration_space, RegisterAccess};

/// Per-device sysfs attribute holding the LTSSM state, where the driver
/// exposes one.
pub const DEFAULT_LTSSM_ATTRIBUTE: &str = "ltssm_state";

/// One way of asking a device for its training state. `Ok(Unknown)` means
/// the source had nothing to say; the tracker moves on to the next source.
pub trait StateSource: Send + Sync {
    fn source(&self) -> ObservationSource;
    fn query(&self, bdf: &Bdf) -> Result<LtssmState, Error>;
}

/// Reads a dedicated state file under the device's sysfs directory.
#[derive(Debug, Clone)]
pub struct SysfsStateSource {
    root: PathBuf,
    attribute: String,
}

impl SysfsStateSource {
    pub fn new(root: impl AsRef<Path>, attribute: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            attribute: attribute.to_string(),
        }
    }
}

impl StateSource for SysfsStateSource {
    fn source(&self) -> ObservationSource {
        ObservationSource::Sysfs
    }

    fn query(&self, bdf: &Bdf) -> Result<LtssmState, Error> {
        let path = self.root.join(bdf.to_string()).join(&self.attribute);
        Ok(LtssmState::parse(&fs::read_to_string(path)?))
    }
}

/// Derive a coarse state from the Link Status register.
pub fn state_from_link_status(status: &LinkStatus) -> LtssmState {
    if status.raw == INVALID_VENDOR_ID {
        // All ones: the function did not respond.
        LtssmState::Unknown
    } else if status.training {
        LtssmState::Recovery
    } else if status.active || (status.width.is_some() && status.speed.is_some()) {
        LtssmState::L0
    } else {
        LtssmState::Detect
    }
}

/// Reads Link Status through the register capability.
pub struct RegisterStateSource {
    access: Arc<dyn RegisterAccess>,
    pcie_cap: u16,
}

impl RegisterStateSource {
    pub fn new(access: Arc<dyn RegisterAccess>, pcie_cap: u16) -> Self {
        Self { access, pcie_cap }
    }
}

impl StateSource for RegisterStateSource {
    fn source(&self) -> ObservationSource {
        ObservationSource::RegisterPoll
    }

    fn query(&self, bdf: &Bdf) -> Result<LtssmState, Error> {
        let word = read_configuration_space::<u16>(
            self.access.as_ref(),
            bdf,
            self.pcie_cap + LinkStatus::REGISTER_OFFSET,
        )?;
        Ok(state_from_link_status(&LinkStatus::from(word)))
    }
}

/// Derive a coarse state from the `LnkSta` block of `lspci -vvv` output.
pub fn parse_lnksta(text: &str) -> Option<LtssmState> {
    static LNK_STA_RE: OnceLock<Option<Regex>> = OnceLock::new();
    static TRAIN_RE: OnceLock<Option<Regex>> = OnceLock::new();

    let lnk_sta_re = LNK_STA_RE
        .get_or_init(|| Regex::new(r"LnkSta:\s*Speed ([0-9.]+|unknown)\s*(?:GT/s)?[^,]*, Width x(\d+)").ok())
        .as_ref()?;
    let train_re = TRAIN_RE
        .get_or_init(|| Regex::new(r"LnkSta:[^\n]*(?:\n\s+[^\n]*)*?\bTrain([+-])").ok())
        .as_ref()?;

    let caps = lnk_sta_re.captures(text)?;
    let width: u8 = caps[2].parse().ok()?;
    let training = train_re
        .captures(text)
        .map(|c| &c[1] == "+")
        .unwrap_or(false);
    Some(if training {
        LtssmState::Recovery
    } else if width == 0 {
        LtssmState::Detect
    } else {
        LtssmState::L0
    })
}

/// Asks `lspci` for the device's link status.
#[derive(Debug, Clone)]
pub struct LspciStateSource {
    timeout: Duration,
}

impl LspciStateSource {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LspciStateSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSource for LspciStateSource {
    fn source(&self) -> ObservationSource {
        ObservationSource::ToolQuery
    }

    fn query(&self, bdf: &Bdf) -> Result<LtssmState, Error> {
        let address = bdf.to_string();
        let out = command_stdout(
            HostCommandSpec::new("lspci", &["-vvv", "-s", &address]).with_timeout(self.timeout),
        )?;
        Ok(parse_lnksta(&out).unwrap_or(LtssmState::Unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::MemoryConfigSpace;

    const LSPCI_UP: &str = "\
03:00.0 Non-Volatile memory controller: Samsung Electronics Co Ltd NVMe SSD Controller PM9A1/PM9A3/980PRO
\t\tLnkCap:\tPort #0, Speed 16GT/s, Width x4, ASPM L1, Exit Latency L1 <64us
\t\tLnkSta:\tSpeed 16GT/s (ok), Width x4 (ok)
\t\t\tTrErr- Train- SlotClk+ DLActive- BWMgmt- ABWMgmt-
";

    #[test]
    fn lnksta_up_link_is_l0() {
        assert_eq!(parse_lnksta(LSPCI_UP), Some(LtssmState::L0));
    }

    #[test]
    fn lnksta_training_is_recovery() {
        let text = LSPCI_UP.replace("Train-", "Train+");
        assert_eq!(parse_lnksta(&text), Some(LtssmState::Recovery));
    }

    #[test]
    fn lnksta_zero_width_is_detect() {
        let text = "\t\tLnkSta:\tSpeed 2.5GT/s, Width x0\n\t\t\tTrErr- Train- SlotClk+ DLActive-\n";
        assert_eq!(parse_lnksta(text), Some(LtssmState::Detect));
        assert_eq!(parse_lnksta("no link block"), None);
    }

    #[test]
    fn link_status_mapping() {
        assert_eq!(state_from_link_status(&LinkStatus::from(0x2044)), LtssmState::L0);
        assert_eq!(state_from_link_status(&LinkStatus::from(0x0844)), LtssmState::Recovery);
        assert_eq!(state_from_link_status(&LinkStatus::from(0x0000)), LtssmState::Detect);
        assert_eq!(state_from_link_status(&LinkStatus::from(0xFFFF)), LtssmState::Unknown);
    }

    #[test]
    fn sysfs_source_reads_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let bdf = Bdf::new(0, 3, 0, 0);
        let dev = dir.path().join(bdf.to_string());
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join(DEFAULT_LTSSM_ATTRIBUTE), "Recovery.RcvrLock\n").unwrap();
        let source = SysfsStateSource::new(dir.path(), DEFAULT_LTSSM_ATTRIBUTE);
        assert_eq!(source.query(&bdf).unwrap(), LtssmState::RecoveryRcvrLock);
        assert!(source.query(&Bdf::new(0, 4, 0, 0)).is_err());
    }

    #[test]
    fn register_source_reads_link_status() {
        let bdf = Bdf::new(0, 3, 0, 0);
        let space = Arc::new(MemoryConfigSpace::new());
        space.set_u16(bdf, 0x40 + LinkStatus::REGISTER_OFFSET, 0x2044);
        let source = RegisterStateSource::new(space, 0x40);
        assert_eq!(source.query(&bdf).unwrap(), LtssmState::L0);
    }
}
