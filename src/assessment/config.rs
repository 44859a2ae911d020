// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::compliance::ComplianceLimits;
use super::correlate::CorrelationWindows;
use crate::counters::DEFAULT_COUNTER_COMMAND;
use crate::error::Error;
use crate::ltssm::DEFAULT_LTSSM_ATTRIBUTE;
use crate::pcie::Bdf;
use crate::register::SYSFS_PCI_DEVICES;
use crate::retrain::{ResetMethod, RetrainConfig, DEFAULT_RETRAIN_TIMEOUT, RETRAIN_POLL_INTERVAL};
use crate::topology::{DeviceSignature, DEFAULT_SWITCH_SIGNATURES};

/// Every tunable of a session. Missing fields in a config file take the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub duration_secs: u64,
    pub snapshot_interval_ms: u64,
    pub reset_interval_ms: u64,
    /// Stop scheduling resets after this many; `None` keeps going until the
    /// session ends.
    pub reset_count: Option<u32>,
    pub methods: Vec<ResetMethod>,
    pub max_targets: usize,
    /// Test exactly these devices instead of every in-scope endpoint.
    pub targets: Vec<Bdf>,
    pub ltssm_interval_ms: u64,
    pub error_interval_ms: u64,
    pub stop_timeout_ms: u64,
    pub retrain_timeout_ms: u64,
    pub retrain_poll_ms: u64,
    /// Budget for retraining a device back up after a failed reset; zero
    /// disables recovery.
    pub recovery_budget_ms: u64,
    pub windows: CorrelationWindows,
    pub limits: ComplianceLimits,
    pub switch_signatures: Vec<DeviceSignature>,
    pub counter_command: String,
    pub sysfs_root: PathBuf,
    pub ltssm_attribute: String,
    /// Fall back to `lspci` when sysfs and registers say nothing.
    pub use_topology_tool: bool,
    pub kernel_log_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: 300,
            snapshot_interval_ms: 5000,
            reset_interval_ms: 30_000,
            reset_count: None,
            methods: vec![ResetMethod::LinkRetrain],
            max_targets: 4,
            targets: Vec::new(),
            ltssm_interval_ms: 100,
            error_interval_ms: 1000,
            stop_timeout_ms: 10_000,
            retrain_timeout_ms: DEFAULT_RETRAIN_TIMEOUT.as_millis() as u64,
            retrain_poll_ms: RETRAIN_POLL_INTERVAL.as_millis() as u64,
            recovery_budget_ms: 10_000,
            windows: CorrelationWindows::default(),
            limits: ComplianceLimits::default(),
            switch_signatures: DEFAULT_SWITCH_SIGNATURES.to_vec(),
            counter_command: DEFAULT_COUNTER_COMMAND.to_string(),
            sysfs_root: PathBuf::from(SYSFS_PCI_DEVICES),
            ltssm_attribute: DEFAULT_LTSSM_ATTRIBUTE.to_string(),
            use_topology_tool: true,
            kernel_log_lines: 50,
        }
    }
}

impl SessionConfig {
    /// Read a JSON config file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let nonzero = [
            ("snapshot_interval_ms", self.snapshot_interval_ms),
            ("reset_interval_ms", self.reset_interval_ms),
            ("ltssm_interval_ms", self.ltssm_interval_ms),
            ("error_interval_ms", self.error_interval_ms),
            ("retrain_timeout_ms", self.retrain_timeout_ms),
            ("retrain_poll_ms", self.retrain_poll_ms),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be non-zero")));
        }
        if self.methods.is_empty() {
            return Err(Error::Config("at least one reset method is required".to_string()));
        }
        if self.max_targets == 0 {
            return Err(Error::Config("max_targets must be at least 1".to_string()));
        }
        if self.switch_signatures.is_empty() {
            return Err(Error::Config("at least one switch signature is required".to_string()));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_millis(self.reset_interval_ms)
    }

    pub fn ltssm_interval(&self) -> Duration {
        Duration::from_millis(self.ltssm_interval_ms)
    }

    pub fn error_interval(&self) -> Duration {
        Duration::from_millis(self.error_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn recovery_budget(&self) -> Duration {
        Duration::from_millis(self.recovery_budget_ms)
    }

    pub fn retrain(&self) -> RetrainConfig {
        RetrainConfig {
            timeout: Duration::from_millis(self.retrain_timeout_ms),
            poll_interval: Duration::from_millis(self.retrain_poll_ms),
        }
    }
}
