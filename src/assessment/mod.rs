// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end quality sessions: run, correlate, score.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::counters::{ErrorDeltas, ErrorSample};
use crate::ltssm::LtssmTransition;
use crate::retrain::{RecoveryReport, ResetOperation};
use crate::topology::{BusScope, DeviceHandle};

pub mod compliance;
pub mod config;
pub mod correlate;
pub mod events;
mod orchestrator;
pub mod scoring;
pub mod snapshot;

pub use compliance::{assess, ComplianceAssessment, ComplianceLimits, ErrorCeilings, Violation};
pub use config::SessionConfig;
pub use correlate::{correlate, CorrelationStatus, CorrelationWindows, EventCorrelation};
pub use events::{EventKind, QualityEvent, Severity};
pub use orchestrator::{Collaborators, QualitySession, SessionProgress, TargetSelection};
pub use scoring::{grade, Category, CategoryScore, Verdict};
pub use snapshot::SystemSnapshot;

/// Append `message` unless an identical one is already recorded.
pub(crate) fn push_unique(list: &mut Vec<String>, message: String) {
    if !list.contains(&message) {
        list.push(message);
    }
}

/// Everything a session produced. Always carries explicit `warnings` and
/// `errors`, empty or not.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub config: SessionConfig,
    pub scope: BusScope,
    pub targets: Vec<DeviceHandle>,
    pub operations: Vec<ResetOperation>,
    pub recoveries: Vec<RecoveryReport>,
    pub snapshots: Vec<SystemSnapshot>,
    pub transitions: Vec<LtssmTransition>,
    pub error_samples: Vec<ErrorSample>,
    pub error_deltas: Option<ErrorDeltas>,
    pub events: Vec<QualityEvent>,
    pub correlations: Vec<EventCorrelation>,
    pub assessment: ComplianceAssessment,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl QualityReport {
    pub fn verdict(&self) -> Verdict {
        self.assessment.verdict
    }
}
