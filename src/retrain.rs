// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link retrain and reset operations.
//!
//! Each method has the same shape: capture the device state, kick the
//! hardware, poll at ~1ms until the device reports completion or the
//! timeout elapses, capture the state again. The poll never runs past the
//! timeout, however slowly the register backend answers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::ltssm::{state_from_link_status, LtssmState};
use crate::pcie::{
    Bdf, DeviceCapabilities, DeviceControl, LinkControl, LinkStatus, PowerControl, PowerState,
    INVALID_VENDOR_ID, PCIE_VENDOR_ID_OFFSET,
};
use crate::register::{read_configuration_space, write_configuration_space, RegisterAccess};
use crate::topology::DeviceHandle;

/// Budget for one retrain to complete before it is declared timed out.
pub const DEFAULT_RETRAIN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Link Status poll resolution.
pub const RETRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// PCIe 6.x ceiling for a retrain to complete.
pub const MAX_RETRAIN_TIME: Duration = Duration::from_millis(1000);

/// Attempts before a device is declared non-recoverable.
pub const MAX_RETRAIN_ATTEMPTS: u32 = 255;

/// Time a function may take to come back from FLR before it must respond.
pub const FLR_COMPLETION_WAIT: Duration = Duration::from_millis(100);

/// D3hot to D0 transition recovery time.
pub const POWER_STATE_SETTLE: Duration = Duration::from_millis(10);

/// Kinds of reset the harness can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMethod {
    LinkRetrain,
    FunctionLevelReset,
    SurpriseRemoval,
    PowerCycle,
}

impl ResetMethod {
    pub fn name(&self) -> &'static str {
        match self {
            ResetMethod::LinkRetrain => "link retrain",
            ResetMethod::FunctionLevelReset => "function-level reset",
            ResetMethod::SurpriseRemoval => "surprise removal",
            ResetMethod::PowerCycle => "power-state cycle",
        }
    }
}

impl fmt::Display for ResetMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetOutcome {
    /// The device reported completion.
    Completed,
    /// Completion was not observed within the timeout.
    TimedOut,
    /// The reset could not be issued (register write failed, method
    /// unsupported, ...).
    Failed,
}

/// A device's state around a reset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviceState {
    pub captured_at: DateTime<Utc>,
    /// The vendor ID read back as something other than all ones.
    pub present: bool,
    pub link_status: Option<LinkStatus>,
    pub ltssm: LtssmState,
}

/// One reset attempt. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetOperation {
    pub device: Bdf,
    pub method: ResetMethod,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    pub timeout: bool,
    pub outcome: ResetOutcome,
    pub pre_state: DeviceState,
    pub post_state: DeviceState,
    /// From kicking the hardware to observed completion.
    pub recovery_time_ms: Option<f64>,
    /// Link Training was seen set at least once.
    pub training_observed: bool,
    pub error: Option<String>,
}

/// Result of [`RetrainController::recover`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub device: Bdf,
    pub attempts: u32,
    pub recovered: bool,
    /// Every attempt failed and the attempt ceiling was reached.
    pub non_recoverable: bool,
    pub elapsed_ms: f64,
    pub operations: Vec<ResetOperation>,
}

/// Hot-plug style removal and re-enumeration of a function.
pub trait SlotControl: Send + Sync {
    fn remove(&self, bdf: &Bdf) -> Result<(), Error>;
    fn rescan(&self) -> Result<(), Error>;
}

/// Slot control through `/sys/bus/pci`.
#[derive(Debug, Clone)]
pub struct SysfsSlotControl {
    root: PathBuf,
    timeout: Duration,
}

pub const SYSFS_PCI_BUS: &str = "/sys/bus/pci";

impl SysfsSlotControl {
    pub fn new() -> Self {
        Self::with_root(SYSFS_PCI_BUS)
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            timeout: DEFAULT_RETRAIN_TIMEOUT,
        }
    }

    // Removal can block in the kernel; the write gets its own thread.
    fn poke(&self, path: PathBuf) -> Result<(), Error> {
        let (tx, rx) = mpsc::channel();
        let target = path.clone();
        thread::Builder::new()
            .name("slot-control".to_string())
            .spawn(move || {
                let _ = tx.send(fs::write(&target, "1"));
            })?;
        match rx.recv_timeout(self.timeout) {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::CommandTimeout {
                program: path.display().to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

impl Default for SysfsSlotControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotControl for SysfsSlotControl {
    fn remove(&self, bdf: &Bdf) -> Result<(), Error> {
        self.poke(self.root.join("devices").join(bdf.to_string()).join("remove"))
    }

    fn rescan(&self) -> Result<(), Error> {
        self.poke(self.root.join("rescan"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrainConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RETRAIN_TIMEOUT,
            poll_interval: RETRAIN_POLL_INTERVAL,
        }
    }
}

/// What an attempt reported before the bookkeeping common to all methods.
struct Attempt {
    outcome: ResetOutcome,
    kicked_at: Option<Instant>,
    completed_at: Option<Instant>,
    training_observed: bool,
    error: Option<String>,
}

impl Attempt {
    fn failed(error: impl fmt::Display) -> Self {
        Self {
            outcome: ResetOutcome::Failed,
            kicked_at: None,
            completed_at: None,
            training_observed: false,
            error: Some(error.to_string()),
        }
    }
}

fn vendor_present(access: &dyn RegisterAccess, bdf: &Bdf) -> bool {
    matches!(
        read_configuration_space::<u16>(access, bdf, PCIE_VENDOR_ID_OFFSET),
        Ok(vendor) if vendor != INVALID_VENDOR_ID
    )
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Issues resets against devices through the register capability.
pub struct RetrainController {
    access: Arc<dyn RegisterAccess>,
    slots: Option<Arc<dyn SlotControl>>,
    config: RetrainConfig,
}

impl RetrainController {
    pub fn new(access: Arc<dyn RegisterAccess>) -> Self {
        Self {
            access,
            slots: None,
            config: RetrainConfig::default(),
        }
    }

    pub fn with_slot_control(mut self, slots: Arc<dyn SlotControl>) -> Self {
        self.slots = Some(slots);
        self
    }

    pub fn with_config(mut self, config: RetrainConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RetrainConfig {
        &self.config
    }

    fn vendor_present(&self, bdf: &Bdf) -> bool {
        vendor_present(self.access.as_ref(), bdf)
    }

    /// Snapshot presence and link state.
    pub fn capture_state(&self, device: &DeviceHandle) -> DeviceState {
        let present = self.vendor_present(&device.bdf);
        let link_status = device.pcie_cap.and_then(|cap| {
            read_configuration_space::<u16>(
                self.access.as_ref(),
                &device.bdf,
                cap + LinkStatus::REGISTER_OFFSET,
            )
            .ok()
            .map(LinkStatus::from)
        });
        DeviceState {
            captured_at: Utc::now(),
            present,
            link_status,
            ltssm: link_status
                .as_ref()
                .map_or(LtssmState::Unknown, state_from_link_status),
        }
    }

    /// Run `done` every poll interval on a worker until it holds or
    /// `deadline` passes. Returns the instant `done` first held.
    ///
    /// The caller stops waiting at `deadline` even while a read inside
    /// `done` is still outstanding; a completion seen after the deadline
    /// counts as a timeout.
    fn poll_until<F>(&self, deadline: Instant, done: F) -> Option<Instant>
    where
        F: FnMut(&dyn RegisterAccess) -> bool + Send + 'static,
    {
        let access = Arc::clone(&self.access);
        let poll_interval = self.config.poll_interval;
        let abandoned = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&abandoned);
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("reset-poll".to_string())
            .spawn(move || {
                let mut done = done;
                while !stop.load(Ordering::Relaxed) {
                    if done(access.as_ref()) {
                        let _ = tx.send(Instant::now());
                        return;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    thread::sleep(poll_interval.min(deadline - now));
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("failed to start completion poll: {e}");
            return None;
        }
        let completed_at = rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .ok()
            .filter(|at| *at <= deadline);
        abandoned.store(true, Ordering::Relaxed);
        completed_at
    }

    /// Sleep for `wait`, but not past `deadline`.
    fn settle(wait: Duration, deadline: Instant) {
        let left = deadline.saturating_duration_since(Instant::now());
        thread::sleep(wait.min(left));
    }

    fn wait_for_vendor(&self, bdf: &Bdf, kicked_at: Instant, deadline: Instant) -> Attempt {
        let bdf = *bdf;
        let completed_at = self.poll_until(deadline, move |access| vendor_present(access, &bdf));
        Attempt {
            outcome: if completed_at.is_some() {
                ResetOutcome::Completed
            } else {
                ResetOutcome::TimedOut
            },
            kicked_at: Some(kicked_at),
            completed_at,
            training_observed: false,
            error: None,
        }
    }

    fn link_retrain(&self, device: &DeviceHandle, deadline: Instant) -> Attempt {
        let Some(cap) = device.pcie_cap else {
            return Attempt::failed("device has no PCI Express capability");
        };
        let access = self.access.as_ref();
        let bdf = &device.bdf;
        let control_offset = cap + LinkControl::REGISTER_OFFSET;
        let status_offset = cap + LinkStatus::REGISTER_OFFSET;

        let control = match read_configuration_space::<u16>(access, bdf, control_offset) {
            Ok(word) => LinkControl(word),
            Err(e) => return Attempt::failed(format!("failed to read Link Control: {e}")),
        };
        if let Err(e) = write_configuration_space(access, bdf, control_offset, control.with_retrain().0)
        {
            return Attempt::failed(format!("failed to set Retrain Link: {e}"));
        }
        let kicked_at = Instant::now();

        // Success needs Link Training observed set and then clear.
        let observed = Arc::new(AtomicBool::new(false));
        let training_seen = Arc::clone(&observed);
        let bdf = *bdf;
        let mut warned = false;
        let completed_at = self.poll_until(deadline, move |access| {
            match read_configuration_space::<u16>(access, &bdf, status_offset) {
                Ok(word) => {
                    if LinkStatus::from(word).training {
                        training_seen.store(true, Ordering::Relaxed);
                        false
                    } else {
                        training_seen.load(Ordering::Relaxed)
                    }
                }
                Err(e) => {
                    if !warned {
                        warned = true;
                        tracing::debug!(device = %bdf, "Link Status read failed while polling: {e}");
                    }
                    false
                }
            }
        });
        let training_observed = observed.load(Ordering::Relaxed);
        Attempt {
            outcome: if completed_at.is_some() {
                ResetOutcome::Completed
            } else {
                ResetOutcome::TimedOut
            },
            kicked_at: Some(kicked_at),
            completed_at,
            training_observed,
            error: None,
        }
    }

    fn function_level_reset(&self, device: &DeviceHandle, deadline: Instant) -> Attempt {
        let Some(cap) = device.pcie_cap else {
            return Attempt::failed("device has no PCI Express capability");
        };
        let access = self.access.as_ref();
        let bdf = &device.bdf;
        let caps = match read_configuration_space::<u32>(
            access,
            bdf,
            cap + DeviceCapabilities::REGISTER_OFFSET,
        ) {
            Ok(word) => DeviceCapabilities(word),
            Err(e) => return Attempt::failed(format!("failed to read Device Capabilities: {e}")),
        };
        if !caps.flr_capable() {
            return Attempt::failed(Error::ResetUnsupported {
                bdf: *bdf,
                method: ResetMethod::FunctionLevelReset.name(),
                reason: "Device Capabilities does not advertise FLR".to_string(),
            });
        }
        let control_offset = cap + DeviceControl::REGISTER_OFFSET;
        let control = match read_configuration_space::<u16>(access, bdf, control_offset) {
            Ok(word) => DeviceControl(word),
            Err(e) => return Attempt::failed(format!("failed to read Device Control: {e}")),
        };
        if let Err(e) = write_configuration_space(access, bdf, control_offset, control.with_flr().0) {
            return Attempt::failed(format!("failed to initiate FLR: {e}"));
        }
        let kicked_at = Instant::now();
        Self::settle(FLR_COMPLETION_WAIT, deadline);
        self.wait_for_vendor(bdf, kicked_at, deadline)
    }

    fn surprise_removal(&self, device: &DeviceHandle, deadline: Instant) -> Attempt {
        let Some(slots) = &self.slots else {
            return Attempt::failed(Error::ResetUnsupported {
                bdf: device.bdf,
                method: ResetMethod::SurpriseRemoval.name(),
                reason: "no slot control available".to_string(),
            });
        };
        if let Err(e) = slots.remove(&device.bdf) {
            return Attempt::failed(format!("failed to remove device: {e}"));
        }
        let kicked_at = Instant::now();
        if let Err(e) = slots.rescan() {
            return Attempt {
                kicked_at: Some(kicked_at),
                ..Attempt::failed(format!("failed to rescan bus: {e}"))
            };
        }
        self.wait_for_vendor(&device.bdf, kicked_at, deadline)
    }

    fn power_cycle(&self, device: &DeviceHandle, deadline: Instant) -> Attempt {
        let Some(pm) = device.pm_cap else {
            return Attempt::failed(Error::ResetUnsupported {
                bdf: device.bdf,
                method: ResetMethod::PowerCycle.name(),
                reason: "device has no Power Management capability".to_string(),
            });
        };
        let access = self.access.as_ref();
        let bdf = &device.bdf;
        let pmcsr = pm + PowerControl::REGISTER_OFFSET;
        let control = match read_configuration_space::<u16>(access, bdf, pmcsr) {
            Ok(word) => PowerControl(word),
            Err(e) => return Attempt::failed(format!("failed to read PMCSR: {e}")),
        };
        if let Err(e) = write_configuration_space(access, bdf, pmcsr, control.with_state(PowerState::D3Hot).0)
        {
            return Attempt::failed(format!("failed to enter D3hot: {e}"));
        }
        let kicked_at = Instant::now();
        Self::settle(POWER_STATE_SETTLE, deadline);
        if let Err(e) = write_configuration_space(access, bdf, pmcsr, control.with_state(PowerState::D0).0) {
            return Attempt {
                kicked_at: Some(kicked_at),
                ..Attempt::failed(format!("failed to return to D0: {e}"))
            };
        }
        let bdf = *bdf;
        let completed_at = self.poll_until(deadline, move |access| {
            let in_d0 = matches!(
                read_configuration_space::<u16>(access, &bdf, pmcsr),
                Ok(word) if PowerControl(word).state() == PowerState::D0
            );
            in_d0 && vendor_present(access, &bdf)
        });
        Attempt {
            outcome: if completed_at.is_some() {
                ResetOutcome::Completed
            } else {
                ResetOutcome::TimedOut
            },
            kicked_at: Some(kicked_at),
            completed_at,
            training_observed: false,
            error: None,
        }
    }

    /// Apply `method` to `device` and record the attempt.
    pub fn reset(&self, device: &DeviceHandle, method: ResetMethod) -> ResetOperation {
        let pre_state = self.capture_state(device);
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + self.config.timeout;

        let attempt = match method {
            ResetMethod::LinkRetrain => self.link_retrain(device, deadline),
            ResetMethod::FunctionLevelReset => self.function_level_reset(device, deadline),
            ResetMethod::SurpriseRemoval => self.surprise_removal(device, deadline),
            ResetMethod::PowerCycle => self.power_cycle(device, deadline),
        };
        let duration = start.elapsed();
        let post_state = self.capture_state(device);

        let recovery_time_ms = match (attempt.kicked_at, attempt.completed_at) {
            (Some(kicked), Some(done)) => Some(millis(done.saturating_duration_since(kicked))),
            _ => None,
        };
        let operation = ResetOperation {
            device: device.bdf,
            method,
            started_at,
            duration_ms: millis(duration),
            success: attempt.outcome == ResetOutcome::Completed,
            timeout: attempt.outcome == ResetOutcome::TimedOut,
            outcome: attempt.outcome,
            pre_state,
            post_state,
            recovery_time_ms,
            training_observed: attempt.training_observed,
            error: attempt.error,
        };
        match operation.outcome {
            ResetOutcome::Completed => tracing::info!(
                device = %device.bdf,
                method = %method,
                recovery_ms = ?operation.recovery_time_ms,
                "reset completed"
            ),
            ResetOutcome::TimedOut => tracing::warn!(
                device = %device.bdf,
                method = %method,
                timeout = ?self.config.timeout,
                "reset timed out"
            ),
            ResetOutcome::Failed => tracing::warn!(
                device = %device.bdf,
                method = %method,
                error = operation.error.as_deref().unwrap_or(""),
                "reset failed"
            ),
        }
        operation
    }

    /// Retrain the link of `device` once.
    pub fn retrain(&self, device: &DeviceHandle) -> ResetOperation {
        self.reset(device, ResetMethod::LinkRetrain)
    }

    /// Retrain repeatedly until the link trains, [`MAX_RETRAIN_ATTEMPTS`]
    /// are spent, or `deadline` passes.
    pub fn recover(&self, device: &DeviceHandle, deadline: Instant) -> RecoveryReport {
        let start = Instant::now();
        let mut operations = Vec::new();
        let mut recovered = false;
        while operations.len() < MAX_RETRAIN_ATTEMPTS as usize && Instant::now() < deadline {
            let op = self.retrain(device);
            recovered = op.success;
            operations.push(op);
            if recovered {
                break;
            }
        }
        let attempts = operations.len() as u32;
        let non_recoverable = !recovered && attempts >= MAX_RETRAIN_ATTEMPTS;
        if non_recoverable {
            tracing::error!(device = %device.bdf, attempts, "device did not recover");
        }
        RecoveryReport {
            device: device.bdf,
            attempts,
            recovered,
            non_recoverable,
            elapsed_ms: millis(start.elapsed()),
            operations,
        }
    }
}
