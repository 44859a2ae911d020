// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives one session: scope, samplers, resets, snapshots, then analysis.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::compliance::assess;
use super::config::SessionConfig;
use super::correlate::correlate;
use super::events::{error_events, ltssm_events, reset_event, EventKind, QualityEvent, Severity};
use super::scoring::ScoreInputs;
use super::snapshot::{degraded_links, SnapshotCollector};
use super::{push_unique, QualityReport};
use crate::counters::{ErrorCounterSampler, SwitchCommandChannel};
use crate::error::Error;
use crate::kernel_log::LogQuery;
use crate::ltssm::{
    LspciStateSource, LtssmTracker, RegisterStateSource, StateSource, SysfsStateSource,
};
use crate::pcie::Bdf;
use crate::register::RegisterAccess;
use crate::retrain::{ResetMethod, RetrainController, SlotControl};
use crate::topology::{resolve_scope, BusScope, DeviceHandle, PciDeviceInfo, ScopeDecision};

// Longest the main loop sleeps between progress reports.
const PROGRESS_TICK: Duration = Duration::from_millis(250);

/// The external capabilities a session runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub registers: Arc<dyn RegisterAccess>,
    pub logs: Arc<dyn LogQuery>,
    /// Without a channel, error counters are not sampled.
    pub switch: Option<Arc<dyn SwitchCommandChannel>>,
    /// Needed for surprise-removal resets only.
    pub slots: Option<Arc<dyn SlotControl>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionProgress {
    pub elapsed: Duration,
    pub total: Duration,
    pub resets: usize,
    pub snapshots: usize,
}

/// The outcome of scope resolution: what will be tested.
#[derive(Debug, Clone)]
pub struct TargetSelection {
    pub scope: BusScope,
    pub targets: Vec<DeviceHandle>,
    /// Candidates dropped, with the reason.
    pub skipped: Vec<String>,
}

pub struct QualitySession {
    config: SessionConfig,
    collaborators: Collaborators,
}

fn random_index(len: usize, fallback: &mut usize) -> usize {
    let mut bytes = [0u8; 8];
    match getrandom::fill(&mut bytes) {
        Ok(()) => (u64::from_le_bytes(bytes) % len as u64) as usize,
        Err(_) => {
            *fallback = fallback.wrapping_add(1);
            *fallback % len
        }
    }
}

impl QualitySession {
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolve the switch's bus scope and pick the devices to test. Fails
    /// if register access is unusable, the switch is missing, an explicit
    /// target is out of scope, or nothing testable remains.
    pub fn select_targets(&self, devices: &[PciDeviceInfo]) -> Result<TargetSelection, Error> {
        self.config.validate()?;
        let registers = self.collaborators.registers.as_ref();
        registers
            .probe()
            .map_err(|e| Error::RegisterAccessUnavailable(e.to_string()))?;

        let scope = resolve_scope(devices, &self.config.switch_signatures, registers);
        if scope.is_empty() {
            return Err(Error::SwitchNotFound {
                signatures: self
                    .config
                    .switch_signatures
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        let candidates: Vec<&PciDeviceInfo> = if self.config.targets.is_empty() {
            scope.endpoints(devices)
        } else {
            self.config
                .targets
                .iter()
                .map(|bdf| {
                    let info = devices.iter().find(|d| d.bdf == *bdf).ok_or_else(|| {
                        Error::TargetOutOfScope {
                            bdf: *bdf,
                            reason: "not present in the device table".to_string(),
                        }
                    })?;
                    match scope.classify(info) {
                        ScopeDecision::InScope => Ok(info),
                        decision => Err(Error::TargetOutOfScope {
                            bdf: *bdf,
                            reason: decision.reason().to_string(),
                        }),
                    }
                })
                .collect::<Result<_, _>>()?
        };

        let mut targets = Vec::new();
        let mut skipped = Vec::new();
        for info in candidates {
            if targets.len() >= self.config.max_targets {
                skipped.push(format!("{}: over the {} target limit", info.bdf, self.config.max_targets));
                continue;
            }
            let handle = DeviceHandle::locate(registers, info, scope.parent_port(&info.bdf));
            if handle.pcie_cap.is_none() {
                tracing::warn!(device = %info.bdf, "no PCI Express capability; skipping");
                skipped.push(format!("{}: no PCI Express capability found", info.bdf));
                continue;
            }
            targets.push(handle);
        }
        if targets.is_empty() {
            return Err(Error::NoTargets);
        }
        Ok(TargetSelection {
            scope,
            targets,
            skipped,
        })
    }

    pub fn run(&self, devices: &[PciDeviceInfo]) -> Result<QualityReport, Error> {
        self.run_with_progress(devices, |_| {})
    }

    /// Run a full session, calling `progress` as it goes. Only scope and
    /// register-access problems are returned as errors; everything after
    /// the first reset is scheduled ends up in the report.
    pub fn run_with_progress<F>(
        &self,
        devices: &[PciDeviceInfo],
        mut progress: F,
    ) -> Result<QualityReport, Error>
    where
        F: FnMut(&SessionProgress),
    {
        let config = &self.config;
        let TargetSelection {
            scope,
            mut targets,
            skipped,
        } = self.select_targets(devices)?;
        let mut warnings = skipped;
        let mut errors = Vec::new();
        let registers = Arc::clone(&self.collaborators.registers);
        let logs = Arc::clone(&self.collaborators.logs);

        let started_at = Utc::now();
        let start = Instant::now();
        tracing::info!(
            targets = targets.len(),
            duration = ?config.duration(),
            "quality session started"
        );

        let mut sampler = match &self.collaborators.switch {
            Some(channel) => {
                let mut sampler = ErrorCounterSampler::new(Arc::clone(channel))
                    .with_command(&config.counter_command)
                    .with_stop_timeout(config.stop_timeout());
                match sampler.start(config.error_interval()) {
                    Ok(()) => Some(sampler),
                    Err(e) => {
                        warnings.push(format!("error counter sampler failed to start: {e}"));
                        None
                    }
                }
            }
            None => {
                warnings.push("no switch command channel; error counters not sampled".to_string());
                None
            }
        };

        let mut trackers = Vec::new();
        for (index, target) in targets.iter().enumerate() {
            let mut sources: Vec<Box<dyn StateSource>> = vec![Box::new(SysfsStateSource::new(
                &config.sysfs_root,
                &config.ltssm_attribute,
            ))];
            if let Some(cap) = target.pcie_cap {
                sources.push(Box::new(RegisterStateSource::new(Arc::clone(&registers), cap)));
            }
            if config.use_topology_tool {
                sources.push(Box::new(LspciStateSource::new()));
            }
            let mut tracker = LtssmTracker::new(target.bdf, sources)
                .with_kernel_log(Arc::clone(&logs), target.upstream.into_iter().collect())
                .with_stop_timeout(config.stop_timeout());
            match tracker.start(config.ltssm_interval(), None) {
                Ok(()) => trackers.push((index, tracker)),
                Err(e) => warnings.push(format!("LTSSM tracker for {} failed to start: {e}", target.bdf)),
            }
        }

        let mut controller = RetrainController::new(Arc::clone(&registers)).with_config(config.retrain());
        if let Some(slots) = &self.collaborators.slots {
            controller = controller.with_slot_control(Arc::clone(slots));
        }
        let collector = SnapshotCollector {
            access: registers.as_ref(),
            logs: logs.as_ref(),
            sysfs_root: &config.sysfs_root,
            excerpt_lines: config.kernel_log_lines,
            since: started_at,
        };
        let max_recovery = Duration::from_millis(config.limits.max_retrain_time_ms);

        let total = config.duration();
        let end = start + total;
        let mut next_snapshot = start;
        let mut next_reset = start + config.reset_interval();
        let mut operations = Vec::new();
        let mut recoveries = Vec::new();
        let mut snapshots = Vec::new();
        let mut events = Vec::new();
        let mut degraded: BTreeSet<Bdf> = BTreeSet::new();
        let mut degradation_events = 0;
        let mut fallback = 0usize;

        loop {
            let now = Instant::now();
            if now >= end {
                break;
            }

            if now >= next_snapshot {
                let snapshot = collector.take(&targets, &mut warnings);
                if let Some(first) = snapshots.first() {
                    let drops = degraded_links(first, &snapshot);
                    let still: BTreeSet<Bdf> = drops.iter().map(|(bdf, _)| *bdf).collect();
                    for (bdf, description) in drops {
                        if degraded.insert(bdf) {
                            tracing::warn!(device = %bdf, "{description}");
                            degradation_events += 1;
                            events.push(QualityEvent {
                                timestamp: snapshot.timestamp,
                                kind: EventKind::PerformanceDrop,
                                severity: Severity::High,
                                device: Some(bdf),
                                description,
                            });
                        }
                    }
                    degraded.retain(|bdf| still.contains(bdf));
                }
                snapshots.push(snapshot);
                next_snapshot += config.snapshot_interval();
            }

            let resets_left = config
                .reset_count
                .map_or(true, |n| operations.len() < n as usize);
            if resets_left && now >= next_reset {
                let target = &targets[random_index(targets.len(), &mut fallback)];
                let method = config.methods[random_index(config.methods.len(), &mut fallback)];
                let op = controller.reset(target, method);
                events.push(reset_event(&op, max_recovery));
                if !op.success {
                    errors.push(format!(
                        "{} on {} {}: {}",
                        method,
                        target.bdf,
                        if op.timeout { "timed out" } else { "failed" },
                        op.error.as_deref().unwrap_or("completion not observed")
                    ));
                    if method == ResetMethod::LinkRetrain && config.recovery_budget_ms > 0 {
                        let report =
                            controller.recover(target, Instant::now() + config.recovery_budget());
                        if !report.recovered {
                            errors.push(format!(
                                "{} did not recover after {} retrain attempts",
                                target.bdf, report.attempts
                            ));
                        }
                        recoveries.push(report);
                    }
                }
                operations.push(op);
                next_reset = Instant::now() + config.reset_interval();
            }

            progress(&SessionProgress {
                elapsed: start.elapsed().min(total),
                total,
                resets: operations.len(),
                snapshots: snapshots.len(),
            });

            let mut wake = next_snapshot.min(end);
            if resets_left {
                wake = wake.min(next_reset);
            }
            let now = Instant::now();
            if wake > now {
                thread::sleep((wake - now).min(PROGRESS_TICK));
            }
        }

        let mut transitions = Vec::new();
        let mut ltssm_data = false;
        for (index, mut tracker) in trackers {
            targets[index].last_state = tracker.current_state();
            match tracker.stop() {
                Ok(result) => {
                    if result.monitoring_successful {
                        ltssm_data = true;
                    } else {
                        push_unique(&mut warnings, format!("no LTSSM data for {}", tracker.device()));
                    }
                    for w in result.warnings {
                        push_unique(&mut warnings, format!("{}: {w}", tracker.device()));
                    }
                    transitions.extend(result.session.records);
                }
                Err(e) => errors.push(format!("LTSSM tracker for {}: {e}", tracker.device())),
            }
        }
        transitions.sort_by_key(|t| t.timestamp);

        let (error_samples, error_deltas) = match sampler.as_mut().map(|s| s.stop()) {
            Some(Ok(result)) => {
                for w in result.session.warnings {
                    push_unique(&mut warnings, w);
                }
                (result.session.session.records, result.deltas)
            }
            Some(Err(e)) => {
                errors.push(format!("error counter sampler: {e}"));
                (Vec::new(), None)
            }
            None => (Vec::new(), None),
        };
        let monitored = start.elapsed();

        events.extend(error_events(&error_samples));
        let unexpected = ltssm_events(
            &transitions,
            operations
                .iter()
                .chain(recoveries.iter().flat_map(|r| r.operations.iter())),
            config.windows.ltssm(),
        );
        let unexpected_transitions = unexpected.len();
        events.extend(unexpected);
        events.sort_by_key(|e| e.timestamp);

        let correlations = correlate(
            &events,
            &error_samples,
            &transitions,
            &operations,
            &config.windows,
        );
        let inputs = ScoreInputs {
            operations: &operations,
            error_deltas,
            monitored,
            ltssm_data,
            unexpected_transitions,
            events: &events,
        };
        let assessment = assess(&inputs, &recoveries, degradation_events, &config.limits);
        tracing::info!(
            grade = assessment.grade,
            verdict = %assessment.verdict,
            violations = assessment.violations.len(),
            "quality session finished"
        );

        Ok(QualityReport {
            started_at,
            ended_at: Utc::now(),
            config: config.clone(),
            scope,
            targets,
            operations,
            recoveries,
            snapshots,
            transitions,
            error_samples,
            error_deltas,
            events,
            correlations,
            assessment,
            warnings,
            errors,
        })
    }
}
