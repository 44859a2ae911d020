// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Quality events: the unit the correlation step lines subsystems up on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::counters::{CounterField, ErrorDeltas, ErrorSample};
use crate::ltssm::LtssmTransition;
use crate::pcie::Bdf;
use crate::retrain::{ResetOperation, ResetOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Reset,
    Error,
    LtssmTransition,
    PerformanceDrop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub severity: Severity,
    /// `None` for switch-wide events such as counter increases.
    pub device: Option<Bdf>,
    pub description: String,
}

/// The event a reset attempt produces.
pub fn reset_event(op: &ResetOperation, max_recovery: Duration) -> QualityEvent {
    let limit_ms = max_recovery.as_secs_f64() * 1000.0;
    let (severity, description) = if !op.post_state.present {
        (
            Severity::Critical,
            format!("device absent after {}", op.method),
        )
    } else {
        match op.outcome {
            ResetOutcome::Completed => {
                let took = op.recovery_time_ms.unwrap_or(op.duration_ms);
                if took <= limit_ms {
                    (Severity::Info, format!("{} completed in {took:.1}ms", op.method))
                } else {
                    (
                        Severity::Medium,
                        format!("{} completed in {took:.1}ms, over the {limit_ms:.0}ms budget", op.method),
                    )
                }
            }
            ResetOutcome::TimedOut => (
                Severity::High,
                format!("{} timed out after {:.1}ms", op.method, op.duration_ms),
            ),
            ResetOutcome::Failed => (
                Severity::High,
                format!(
                    "{} failed: {}",
                    op.method,
                    op.error.as_deref().unwrap_or("unknown error")
                ),
            ),
        }
    };
    QualityEvent {
        timestamp: op.started_at,
        kind: EventKind::Reset,
        severity,
        device: Some(op.device),
        description,
    }
}

fn counter_severity(field: CounterField) -> Severity {
    match field {
        CounterField::BadTlp => Severity::High,
        CounterField::PortReceive | CounterField::BadDllp => Severity::Medium,
        CounterField::RecDiag => Severity::Low,
    }
}

/// One event per counter that rose between consecutive samples.
pub fn error_events(samples: &[ErrorSample]) -> Vec<QualityEvent> {
    let mut events = Vec::new();
    for pair in samples.windows(2) {
        let (deltas, _) = ErrorDeltas::between(&pair[0], &pair[1]);
        for field in CounterField::ALL {
            let delta = deltas.get(field);
            if delta > 0 {
                events.push(QualityEvent {
                    timestamp: pair[1].timestamp,
                    kind: EventKind::Error,
                    severity: counter_severity(field),
                    device: None,
                    description: format!("{delta} new {field}"),
                });
            }
        }
    }
    events
}

/// `at` falls inside the span `op` ran for, widened by `window` on both
/// sides.
fn during(op: &ResetOperation, at: DateTime<Utc>, window: Duration) -> bool {
    let Some(offset) = (at - op.started_at).num_microseconds() else {
        return false;
    };
    let window = i128::try_from(window.as_micros()).unwrap_or(i128::MAX / 2);
    let length = (op.duration_ms.max(0.0) * 1000.0) as i128;
    (-window..=length + window).contains(&i128::from(offset))
}

/// Disruptive transitions not explained by a reset on the same device.
///
/// `operations` must include recovery retrains as well as scheduled resets.
pub fn ltssm_events<'a>(
    transitions: &[LtssmTransition],
    operations: impl IntoIterator<Item = &'a ResetOperation>,
    window: Duration,
) -> Vec<QualityEvent> {
    let operations: Vec<&ResetOperation> = operations.into_iter().collect();
    transitions
        .iter()
        .filter(|t| t.to.is_disruptive())
        .filter(|t| {
            !operations
                .iter()
                .any(|op| op.device == t.device && during(op, t.timestamp, window))
        })
        .map(|t| QualityEvent {
            timestamp: t.timestamp,
            kind: EventKind::LtssmTransition,
            severity: if t.to.is_link_down() {
                Severity::High
            } else {
                Severity::Medium
            },
            device: Some(t.device),
            description: format!("unexpected transition {} -> {}", t.from, t.to),
        })
        .collect()
}

/// Events of `severity` in `events`.
pub fn count_severity(events: &[QualityEvent], severity: Severity) -> usize {
    events.iter().filter(|e| e.severity == severity).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ltssm::{LtssmState, ObservationSource};
    use crate::retrain::{DeviceState, ResetMethod};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn state(present: bool) -> DeviceState {
        DeviceState {
            captured_at: at(0),
            present,
            link_status: None,
            ltssm: LtssmState::Unknown,
        }
    }

    fn op(outcome: ResetOutcome, recovery_ms: Option<f64>, present: bool) -> ResetOperation {
        ResetOperation {
            device: Bdf::new(0, 3, 0, 0),
            method: ResetMethod::LinkRetrain,
            started_at: at(100),
            duration_ms: recovery_ms.unwrap_or(5000.0),
            success: outcome == ResetOutcome::Completed,
            timeout: outcome == ResetOutcome::TimedOut,
            outcome,
            pre_state: state(true),
            post_state: state(present),
            recovery_time_ms: recovery_ms,
            training_observed: true,
            error: None,
        }
    }

    #[test]
    fn reset_severities() {
        let limit = Duration::from_millis(1000);
        let sev = |o| reset_event(&o, limit).severity;
        assert_eq!(sev(op(ResetOutcome::Completed, Some(12.0), true)), Severity::Info);
        assert_eq!(sev(op(ResetOutcome::Completed, Some(1500.0), true)), Severity::Medium);
        assert_eq!(sev(op(ResetOutcome::TimedOut, None, true)), Severity::High);
        assert_eq!(sev(op(ResetOutcome::Failed, None, true)), Severity::High);
        assert_eq!(sev(op(ResetOutcome::TimedOut, None, false)), Severity::Critical);
    }

    #[test]
    fn counter_increases_become_events() {
        let sample = |t, tlp, diag| ErrorSample {
            timestamp: at(t),
            port_receive: 5,
            bad_tlp: tlp,
            bad_dllp: 0,
            rec_diag: diag,
        };
        let events = error_events(&[sample(0, 1, 0), sample(1, 1, 0), sample(2, 3, 4)]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(events[0].description, "2 new bad TLPs");
        assert_eq!(events[1].severity, Severity::Low);
        assert_eq!(events[0].timestamp, at(2));
    }

    #[test]
    fn transitions_near_resets_are_expected() {
        let transition = |secs, to| LtssmTransition {
            timestamp: at(secs),
            device: Bdf::new(0, 3, 0, 0),
            source: ObservationSource::RegisterPoll,
            from: LtssmState::L0,
            to,
            duration_ms: None,
        };
        let ops = [op(ResetOutcome::Completed, Some(10.0), true)];
        let events = ltssm_events(
            &[
                transition(101, LtssmState::Recovery),
                transition(110, LtssmState::Recovery),
                transition(120, LtssmState::Detect),
                transition(121, LtssmState::L0),
            ],
            &ops,
            Duration::from_secs(2),
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, Severity::Medium);
        assert_eq!(events[1].severity, Severity::High);
    }

    fn recovery(device: Bdf, secs: i64) -> LtssmTransition {
        LtssmTransition {
            timestamp: at(secs),
            device,
            source: ObservationSource::RegisterPoll,
            from: LtssmState::L0,
            to: LtssmState::Recovery,
            duration_ms: None,
        }
    }

    #[test]
    fn transitions_late_in_a_long_reset_are_expected() {
        let device = Bdf::new(0, 3, 0, 0);
        // Timed out after 5s; training was still visible at the end.
        let ops = [op(ResetOutcome::TimedOut, None, true)];
        let events = ltssm_events(
            &[recovery(device, 104), recovery(device, 106), recovery(device, 108)],
            &ops,
            Duration::from_secs(2),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, at(108));
    }

    #[test]
    fn recovery_retrain_transitions_are_expected() {
        let device = Bdf::new(0, 3, 0, 0);
        let scheduled = [op(ResetOutcome::TimedOut, None, true)];
        let retry = ResetOperation {
            started_at: at(130),
            duration_ms: 40.0,
            ..op(ResetOutcome::Completed, Some(40.0), true)
        };
        let recoveries = [vec![retry]];
        let transitions = [recovery(device, 131)];

        let unexplained = ltssm_events(&transitions, &scheduled, Duration::from_secs(2));
        assert_eq!(unexplained.len(), 1);

        let all = scheduled
            .iter()
            .chain(recoveries.iter().flatten());
        assert!(ltssm_events(&transitions, all, Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn resets_on_other_devices_explain_nothing() {
        let ops = [op(ResetOutcome::Completed, Some(10.0), true)];
        let events = ltssm_events(
            &[recovery(Bdf::new(0, 4, 0, 0), 100)],
            &ops,
            Duration::from_secs(2),
        );
        assert_eq!(events.len(), 1);
    }
}
