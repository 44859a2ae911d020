// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lining up independently sampled timelines around each quality event.
//!
//! All timestamps come from the same wall clock, so windows are plain
//! timestamp differences. The widths are empirical; they do not scale with
//! the sampling intervals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::events::{EventKind, QualityEvent};
use crate::counters::{ErrorDeltas, ErrorSample};
use crate::ltssm::LtssmTransition;
use crate::retrain::{ResetMethod, ResetOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationWindows {
    pub error_ms: u64,
    pub ltssm_ms: u64,
    /// Retrain/LTSSM cross-check.
    pub retrain_ms: u64,
}

impl Default for CorrelationWindows {
    fn default() -> Self {
        Self {
            error_ms: 5000,
            ltssm_ms: 2000,
            retrain_ms: 1000,
        }
    }
}

impl CorrelationWindows {
    pub fn error(&self) -> Duration {
        Duration::from_millis(self.error_ms)
    }

    pub fn ltssm(&self) -> Duration {
        Duration::from_millis(self.ltssm_ms)
    }

    pub fn retrain(&self) -> Duration {
        Duration::from_millis(self.retrain_ms)
    }
}

/// `|a - b| <= window`.
pub fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> bool {
    match (a - b).num_microseconds() {
        Some(us) => u128::from(us.unsigned_abs()) <= window.as_micros(),
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStatus {
    /// The subsystem produced no data at all.
    NoData,
    /// Data exists, none of it near the event.
    NoMatch,
    Matched,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorCorrelation {
    pub status: CorrelationStatus,
    pub samples_in_window: usize,
    pub deltas: Option<ErrorDeltas>,
}

/// Counter movement around `at`: the last in-window sample against the last
/// sample before the window (or the first in-window one).
pub fn correlate_errors(
    at: DateTime<Utc>,
    samples: &[ErrorSample],
    window: Duration,
) -> ErrorCorrelation {
    if samples.is_empty() {
        return ErrorCorrelation {
            status: CorrelationStatus::NoData,
            samples_in_window: 0,
            deltas: None,
        };
    }
    let in_window: Vec<&ErrorSample> = samples
        .iter()
        .filter(|s| within(at, s.timestamp, window))
        .collect();
    let (Some(first), Some(last)) = (in_window.first(), in_window.last()) else {
        return ErrorCorrelation {
            status: CorrelationStatus::NoMatch,
            samples_in_window: 0,
            deltas: None,
        };
    };
    let base = samples
        .iter()
        .filter(|s| s.timestamp < first.timestamp)
        .last()
        .unwrap_or(first);
    ErrorCorrelation {
        status: CorrelationStatus::Matched,
        samples_in_window: in_window.len(),
        deltas: Some(ErrorDeltas::between(base, last).0),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LtssmCorrelation {
    pub status: CorrelationStatus,
    pub transitions: Vec<LtssmTransition>,
}

/// Transitions near `at`, restricted to `event`'s device when it has one.
pub fn correlate_ltssm(
    event: &QualityEvent,
    transitions: &[LtssmTransition],
    window: Duration,
) -> LtssmCorrelation {
    if transitions.is_empty() {
        return LtssmCorrelation {
            status: CorrelationStatus::NoData,
            transitions: Vec::new(),
        };
    }
    let matched: Vec<LtssmTransition> = transitions
        .iter()
        .filter(|t| event.device.map_or(true, |d| d == t.device))
        .filter(|t| within(event.timestamp, t.timestamp, window))
        .cloned()
        .collect();
    LtssmCorrelation {
        status: if matched.is_empty() {
            CorrelationStatus::NoMatch
        } else {
            CorrelationStatus::Matched
        },
        transitions: matched,
    }
}

/// Whether a retrain shows up as an entry into Recovery near its start.
/// `None` for other methods or when the device has no LTSSM data.
pub fn confirm_retrain(
    op: &ResetOperation,
    transitions: &[LtssmTransition],
    window: Duration,
) -> Option<bool> {
    if op.method != ResetMethod::LinkRetrain {
        return None;
    }
    let mut own = transitions.iter().filter(|t| t.device == op.device).peekable();
    own.peek()?;
    Some(own.any(|t| t.to.is_recovery() && within(op.started_at, t.timestamp, window)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventCorrelation {
    pub event: QualityEvent,
    pub errors: ErrorCorrelation,
    pub ltssm: LtssmCorrelation,
    /// Reset events only.
    pub retrain_confirmed: Option<bool>,
}

/// Correlate every event against both timelines.
pub fn correlate(
    events: &[QualityEvent],
    samples: &[ErrorSample],
    transitions: &[LtssmTransition],
    operations: &[ResetOperation],
    windows: &CorrelationWindows,
) -> Vec<EventCorrelation> {
    events
        .iter()
        .map(|event| {
            let retrain_confirmed = if event.kind == EventKind::Reset {
                operations
                    .iter()
                    .find(|op| Some(op.device) == event.device && op.started_at == event.timestamp)
                    .and_then(|op| confirm_retrain(op, transitions, windows.retrain()))
            } else {
                None
            };
            EventCorrelation {
                event: event.clone(),
                errors: correlate_errors(event.timestamp, samples, windows.error()),
                ltssm: correlate_ltssm(event, transitions, windows.ltssm()),
                retrain_confirmed,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::events::Severity;
    use crate::ltssm::{LtssmState, ObservationSource};
    use crate::pcie::Bdf;
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn sample(millis: i64, bad_tlp: u64) -> ErrorSample {
        ErrorSample {
            timestamp: at(millis),
            port_receive: 0,
            bad_tlp,
            bad_dllp: 0,
            rec_diag: 0,
        }
    }

    #[test]
    fn error_window_boundaries() {
        let window = CorrelationWindows::default().error();
        let near = correlate_errors(at(100_000), &[sample(104_500, 1)], window);
        assert_eq!(near.status, CorrelationStatus::Matched);
        let far = correlate_errors(at(100_000), &[sample(106_000, 1)], window);
        assert_eq!(far.status, CorrelationStatus::NoMatch);
        let none = correlate_errors(at(100_000), &[], window);
        assert_eq!(none.status, CorrelationStatus::NoData);
    }

    #[test]
    fn error_delta_uses_sample_before_window() {
        let samples = [sample(90_000, 2), sample(99_000, 5), sample(101_000, 9), sample(120_000, 50)];
        let c = correlate_errors(at(100_000), &samples, Duration::from_secs(5));
        assert_eq!(c.samples_in_window, 2);
        assert_eq!(c.deltas.unwrap().bad_tlp, 7);

        let c = correlate_errors(at(100_000), &samples[1..], Duration::from_secs(5));
        assert_eq!(c.deltas.unwrap().bad_tlp, 4);
    }

    #[test]
    fn ltssm_filtered_by_device() {
        let device = Bdf::new(0, 3, 0, 0);
        let other = Bdf::new(0, 4, 0, 0);
        let transition = |millis, device| LtssmTransition {
            timestamp: at(millis),
            device,
            source: ObservationSource::Sysfs,
            from: LtssmState::L0,
            to: LtssmState::Recovery,
            duration_ms: None,
        };
        let event = QualityEvent {
            timestamp: at(100_000),
            kind: EventKind::Reset,
            severity: Severity::Info,
            device: Some(device),
            description: String::new(),
        };
        let transitions = [transition(100_500, other), transition(101_500, device)];
        let c = correlate_ltssm(&event, &transitions, Duration::from_secs(2));
        assert_eq!(c.status, CorrelationStatus::Matched);
        assert_eq!(c.transitions.len(), 1);
        assert_eq!(c.transitions[0].device, device);
        let c = correlate_ltssm(&event, &transitions, Duration::from_secs(1));
        assert_eq!(c.status, CorrelationStatus::NoMatch);
    }
}
