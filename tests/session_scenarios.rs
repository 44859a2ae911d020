// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole sessions against an in-memory switch.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use linkqa::assessment::Verdict;
use linkqa::counters::SwitchCommandChannel;
use linkqa::kernel_log::{KernelLine, LogQuery};
use linkqa::pcie::{
    LinkStatus, PCIE_CAP_POINTER, PCIE_CLASS_REVISION_OFFSET, PCIE_HEADER_TYPE_OFFSET,
    PCIE_SECONDARY_BUS_OFFSET, PCIE_SUBORDINATE_BUS_OFFSET, PCIE_VENDOR_ID_OFFSET,
};
use linkqa::register::{MemoryConfigSpace, TrainingBehavior};
use linkqa::retrain::ResetMethod;
use linkqa::topology::{scan_config_space, PciDeviceInfo};
use linkqa::{Bdf, Collaborators, Error, QualitySession, SessionConfig};

const UPSTREAM: Bdf = Bdf::new(0, 1, 0, 0);
const DOWNSTREAM: Bdf = Bdf::new(0, 2, 0, 0);
const ENDPOINT: Bdf = Bdf::new(0, 3, 0, 0);
const OUTSIDE: Bdf = Bdf::new(0, 0x40, 0, 0);
const PCIE_CAP: u16 = 0x40;

struct QuietLog;

impl LogQuery for QuietLog {
    fn recent_kernel_lines(&self, _: Option<DateTime<Utc>>) -> Result<Vec<KernelLine>, Error> {
        Ok(Vec::new())
    }
}

struct CleanSwitch;

impl SwitchCommandChannel for CleanSwitch {
    fn query(&self, _: &str) -> Result<String, Error> {
        Ok("Port 8\n  port receive errors: 0\n  bad TLPs: 0\n  bad DLLPs: 0\n  \
            recovery diagnostic events: 0\n"
            .to_string())
    }
}

fn function(space: &MemoryConfigSpace, bdf: Bdf, id: u32, class: u32, header_type: u8) {
    space.set_u32(bdf, PCIE_VENDOR_ID_OFFSET, id);
    space.set_u32(bdf, PCIE_CLASS_REVISION_OFFSET, class << 8);
    space.set_u8(bdf, PCIE_HEADER_TYPE_OFFSET, header_type);
}

fn port(space: &MemoryConfigSpace, bdf: Bdf, secondary: u8, subordinate: u8) {
    function(space, bdf, 0xc030_1000, 0x060400, 0x01);
    space.set_u8(bdf, PCIE_SECONDARY_BUS_OFFSET, secondary);
    space.set_u8(bdf, PCIE_SUBORDINATE_BUS_OFFSET, subordinate);
}

fn endpoint(space: &MemoryConfigSpace, bdf: Bdf, behavior: TrainingBehavior) {
    function(space, bdf, 0xa80a_144d, 0x010802, 0x00);
    space.set_u8(bdf, PCIE_CAP_POINTER, PCIE_CAP as u8);
    space.set_u16(bdf, PCIE_CAP, 0x0010);
    // Gen4 x4, link active.
    space.set_u16(bdf, PCIE_CAP + LinkStatus::REGISTER_OFFSET, 0x2044);
    space.set_training_behavior(bdf, PCIE_CAP, behavior);
}

/// Switch at 01:00.0 with one downstream port leading to an NVMe drive,
/// plus a drive on a root port elsewhere.
fn switch_space(behavior: TrainingBehavior) -> Arc<MemoryConfigSpace> {
    let space = Arc::new(MemoryConfigSpace::new());
    port(&space, UPSTREAM, 2, 4);
    port(&space, DOWNSTREAM, 3, 3);
    endpoint(&space, ENDPOINT, behavior);
    endpoint(&space, OUTSIDE, TrainingBehavior::Completes { training_reads: 1 });
    space
}

fn quick_config() -> SessionConfig {
    let missing = std::env::temp_dir().join("linkqa-no-such-sysfs");
    SessionConfig {
        duration_secs: 2,
        snapshot_interval_ms: 250,
        reset_interval_ms: 200,
        reset_count: Some(0),
        ltssm_interval_ms: 10,
        error_interval_ms: 50,
        stop_timeout_ms: 2000,
        sysfs_root: missing,
        use_topology_tool: false,
        ..SessionConfig::default()
    }
}

fn session(space: &Arc<MemoryConfigSpace>, config: SessionConfig) -> (QualitySession, Vec<PciDeviceInfo>) {
    let devices = scan_config_space(space.as_ref(), 0);
    let collaborators = Collaborators {
        registers: space.clone(),
        logs: Arc::new(QuietLog),
        switch: Some(Arc::new(CleanSwitch)),
        slots: None,
    };
    (QualitySession::new(config, collaborators), devices)
}

#[test]
fn stable_session_without_resets_passes() {
    let space = switch_space(TrainingBehavior::Completes { training_reads: 5 });
    let (session, devices) = session(&space, quick_config());
    let report = session.run(&devices).unwrap();

    assert!(report.operations.is_empty());
    assert_eq!(space.write_count(), 0);
    assert_eq!(report.targets.len(), 1);
    assert_eq!(report.targets[0].bdf, ENDPOINT);
    assert_eq!(report.targets[0].upstream, Some(DOWNSTREAM));
    assert!(report.assessment.grade >= 20, "grade {}", report.assessment.grade);
    assert!(report.assessment.violations.is_empty(), "{:?}", report.assessment.violations);
    assert_eq!(report.verdict(), Verdict::Pass);
    assert_eq!(report.error_deltas.map(|d| d.total()), Some(0));
    assert!(!report.snapshots.is_empty());
    assert!(report.transitions.iter().any(|t| t.device == ENDPOINT));
    assert!(report.errors.is_empty(), "{:?}", report.errors);
}

#[test]
fn retrain_session_records_every_attempt() {
    let space = switch_space(TrainingBehavior::Completes { training_reads: 20 });
    let config = SessionConfig {
        reset_count: Some(3),
        methods: vec![ResetMethod::LinkRetrain],
        ..quick_config()
    };
    let (session, devices) = session(&space, config);
    let mut ticks = 0;
    let report = session
        .run_with_progress(&devices, |p| {
            ticks += 1;
            assert!(p.elapsed <= p.total);
        })
        .unwrap();

    assert!(ticks > 0);
    assert_eq!(report.operations.len(), 3);
    assert!(report.operations.iter().all(|op| op.device == ENDPOINT));
    assert!(report.operations.iter().all(|op| op.success && !op.timeout));
    assert_eq!(report.assessment.success_rate, Some(100.0));
    assert!(report.recoveries.is_empty());
    assert!(report.assessment.violations.is_empty(), "{:?}", report.assessment.violations);
    // One reset event per attempt, each correlated.
    assert_eq!(report.correlations.iter().filter(|c| c.retrain_confirmed.is_some()).count(), 3);
}

#[test]
fn stuck_link_is_reported_not_fatal() {
    let space = switch_space(TrainingBehavior::Stuck);
    let config = SessionConfig {
        reset_count: Some(2),
        retrain_timeout_ms: 100,
        recovery_budget_ms: 0,
        ..quick_config()
    };
    let (session, devices) = session(&space, config);
    let report = session.run(&devices).unwrap();

    assert_eq!(report.operations.len(), 2);
    assert!(report.operations.iter().all(|op| op.timeout && op.error.is_none()));
    assert_eq!(report.assessment.success_rate, Some(0.0));
    assert!(report
        .assessment
        .violations
        .iter()
        .any(|v| v.requirement == "Resets complete successfully"));
    assert_eq!(report.errors.len(), 2);
    assert!(!report.assessment.compliant);
}

#[test]
fn missing_switch_touches_nothing() {
    let space = Arc::new(MemoryConfigSpace::new());
    endpoint(&space, OUTSIDE, TrainingBehavior::Completes { training_reads: 1 });
    let config = SessionConfig {
        reset_count: None,
        ..quick_config()
    };
    let (session, devices) = session(&space, config);
    let err = session.run(&devices).unwrap_err();
    assert!(matches!(err, Error::SwitchNotFound { .. }), "{err}");
    assert_eq!(space.write_count(), 0);
}

#[test]
fn target_outside_switch_is_refused() {
    let space = switch_space(TrainingBehavior::Completes { training_reads: 1 });
    let config = SessionConfig {
        targets: vec![OUTSIDE],
        reset_count: None,
        ..quick_config()
    };
    let (session, devices) = session(&space, config);
    match session.run(&devices) {
        Err(Error::TargetOutOfScope { bdf, .. }) => assert_eq!(bdf, OUTSIDE),
        other => panic!("expected an out-of-scope error, got {:?}", other.map(|r| r.verdict())),
    }
    assert_eq!(space.write_count(), 0);
}

#[test]
fn unusable_register_access_refuses_to_start() {
    let space = switch_space(TrainingBehavior::Completes { training_reads: 1 });
    let (session, devices) = session(&space, quick_config());
    space.set_unavailable(Some("not running as root"));
    let err = session.run(&devices).unwrap_err();
    assert!(matches!(err, Error::RegisterAccessUnavailable(_)), "{err}");
    assert_eq!(space.write_count(), 0);
}

#[test]
fn scope_selection_lists_ports_and_targets() {
    let space = switch_space(TrainingBehavior::Completes { training_reads: 1 });
    let (session, devices) = session(&space, quick_config());
    let selection = session.select_targets(&devices).unwrap();
    let ports: Vec<Bdf> = selection.scope.ports.iter().map(|p| p.bdf).collect();
    assert_eq!(ports, vec![UPSTREAM, DOWNSTREAM]);
    assert_eq!(selection.targets.len(), 1);
    assert_eq!(selection.targets[0].pcie_cap, Some(PCIE_CAP));
}
