// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Linux configuration space access through
//! `/sys/bus/pci/devices/<address>/config`.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use super::{RegisterAccess, RegisterError, Width, SYSFS_PCI_DEVICES};
use crate::pcie::Bdf;

#[derive(Debug, Clone)]
pub struct SysfsConfigSpace {
    root: PathBuf,
}

impl SysfsConfigSpace {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from(SYSFS_PCI_DEVICES),
        }
    }

    /// Use an alternate device tree, e.g. a scratch directory holding
    /// `<address>/config` files.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn config_path(&self, bdf: &Bdf) -> PathBuf {
        self.root.join(bdf.to_string()).join("config")
    }

    fn first_config_file(&self) -> Result<Option<PathBuf>, RegisterError> {
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path().join("config");
            if path.exists() {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

impl Default for SysfsConfigSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAccess for SysfsConfigSpace {
    fn read_config(&self, bdf: &Bdf, offset: u16, width: Width) -> Result<u32, RegisterError> {
        width.check(offset)?;
        let file = File::open(self.config_path(bdf))?;
        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf[..width.bytes()], u64::from(offset))?;
        Ok(u32::from_le_bytes(buf) & width.mask())
    }

    fn write_config(
        &self,
        bdf: &Bdf,
        offset: u16,
        width: Width,
        value: u32,
    ) -> Result<(), RegisterError> {
        width.check(offset)?;
        let file = OpenOptions::new()
            .write(true)
            .open(self.config_path(bdf))?;
        let buf = (value & width.mask()).to_le_bytes();
        file.write_all_at(&buf[..width.bytes()], u64::from(offset))?;
        Ok(())
    }

    fn probe(&self) -> Result<(), RegisterError> {
        if !self.root.is_dir() {
            return Err(RegisterError::Unavailable(format!(
                "{} does not exist",
                self.root.display()
            )));
        }
        // Config space beyond the first 64 bytes, and every write, needs
        // write access to the config files. Nothing is written here.
        if let Some(config) = self.first_config_file()? {
            OpenOptions::new().write(true).open(&config).map_err(|e| {
                RegisterError::Unavailable(format!(
                    "cannot open {} for writing: {e}",
                    config.display()
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reads_and_writes_little_endian_words() {
        let dir = tempfile::tempdir().unwrap();
        let bdf = Bdf::new(0, 3, 0, 0);
        let dev = dir.path().join(bdf.to_string());
        fs::create_dir_all(&dev).unwrap();
        let mut config = vec![0u8; 256];
        config[0] = 0x4d;
        config[1] = 0x14;
        fs::write(dev.join("config"), &config).unwrap();

        let access = SysfsConfigSpace::with_root(dir.path());
        access.probe().unwrap();
        assert_eq!(access.read_config(&bdf, 0, Width::Word).unwrap(), 0x144d);

        access.write_config(&bdf, 0x50, Width::Word, 0x2044).unwrap();
        assert_eq!(access.read_config(&bdf, 0x50, Width::Byte).unwrap(), 0x44);
        assert_eq!(access.read_config(&bdf, 0x50, Width::Dword).unwrap(), 0x2044);
    }

    #[test]
    fn missing_device_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let access = SysfsConfigSpace::with_root(dir.path());
        assert!(access
            .read_config(&Bdf::new(0, 9, 0, 0), 0, Width::Word)
            .is_err());
    }

    #[test]
    fn unwritable_config_space_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let bdf = Bdf::new(0, 3, 0, 0);
        // Not openable for writing, whoever runs the test.
        fs::create_dir_all(dir.path().join(bdf.to_string()).join("config")).unwrap();

        let access = SysfsConfigSpace::with_root(dir.path());
        match access.probe() {
            Err(RegisterError::Unavailable(reason)) => {
                assert!(reason.contains("for writing"), "{reason}")
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[test]
    fn missing_root_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let access = SysfsConfigSpace::with_root(dir.path().join("absent"));
        assert!(matches!(access.probe(), Err(RegisterError::Unavailable(_))));
    }
}
