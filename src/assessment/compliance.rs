// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCIe 6.x numeric limits and the compliance verdict.

use serde::{Deserialize, Serialize};

use super::events::Severity;
use super::scoring::{
    average_recovery_ms, grade, hourly_rate, overall_score, score_categories, success_rate,
    CategoryScore, ScoreInputs, Verdict,
};
use crate::counters::CounterField;
use crate::retrain::{RecoveryReport, MAX_RETRAIN_ATTEMPTS, MAX_RETRAIN_TIME};

/// Hourly ceilings for each switch error counter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorCeilings {
    pub port_receive: f64,
    pub bad_tlp: f64,
    pub bad_dllp: f64,
    pub rec_diag: f64,
}

impl Default for ErrorCeilings {
    fn default() -> Self {
        Self {
            port_receive: 10.0,
            bad_tlp: 1.0,
            bad_dllp: 5.0,
            rec_diag: 10.0,
        }
    }
}

impl ErrorCeilings {
    pub fn per_hour(&self, field: CounterField) -> f64 {
        match field {
            CounterField::PortReceive => self.port_receive,
            CounterField::BadTlp => self.bad_tlp,
            CounterField::BadDllp => self.bad_dllp,
            CounterField::RecDiag => self.rec_diag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceLimits {
    pub max_retrain_time_ms: u64,
    /// Percent.
    pub min_reset_success_rate: f64,
    pub errors: ErrorCeilings,
    pub max_degradation_events: usize,
    pub max_recovery_attempts: u32,
}

impl Default for ComplianceLimits {
    fn default() -> Self {
        Self {
            max_retrain_time_ms: MAX_RETRAIN_TIME.as_millis() as u64,
            min_reset_success_rate: 99.0,
            errors: ErrorCeilings::default(),
            max_degradation_events: 0,
            max_recovery_attempts: MAX_RETRAIN_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub requirement: String,
    pub limit: String,
    pub observed: String,
    pub severity: Severity,
    pub spec_section: String,
    pub remediation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceAssessment {
    pub category_scores: Vec<CategoryScore>,
    pub violations: Vec<Violation>,
    pub overall_score: f64,
    /// 1-25.
    pub grade: u8,
    pub verdict: Verdict,
    pub success_rate: Option<f64>,
    pub average_recovery_ms: Option<f64>,
    pub compliant: bool,
}

const SECTION_TRAINING: &str = "PCIe Base 6.0 §4.2 Link Initialization and Training";
const SECTION_ERRORS: &str = "PCIe Base 6.0 §6.2 Error Signaling and Logging";
const SECTION_LINK_STATUS: &str = "PCIe Base 6.0 §7.5.3.8 Link Status Register";

fn check_retrain_time(inputs: &ScoreInputs<'_>, limits: &ComplianceLimits) -> Option<Violation> {
    let limit_ms = limits.max_retrain_time_ms as f64;
    let slow: Vec<f64> = inputs
        .operations
        .iter()
        .filter_map(|op| {
            if op.timeout {
                Some(op.duration_ms)
            } else {
                op.recovery_time_ms.filter(|&t| t > limit_ms)
            }
        })
        .collect();
    let worst = slow.iter().copied().fold(f64::NAN, f64::max);
    (!slow.is_empty()).then(|| Violation {
        requirement: "Link retrain completes within the recovery budget".to_string(),
        limit: format!("{limit_ms:.0}ms"),
        observed: format!(
            "{} of {} resets over budget, worst {worst:.1}ms",
            slow.len(),
            inputs.operations.len()
        ),
        severity: Severity::High,
        spec_section: SECTION_TRAINING.to_string(),
        remediation: "Check equalization settings and signal integrity on the affected \
                      links; review switch port retimer configuration."
            .to_string(),
    })
}

fn check_success_rate(inputs: &ScoreInputs<'_>, limits: &ComplianceLimits) -> Option<Violation> {
    let rate = success_rate(inputs.operations)?;
    (rate < limits.min_reset_success_rate).then(|| Violation {
        requirement: "Resets complete successfully".to_string(),
        limit: format!(">= {:.1}%", limits.min_reset_success_rate),
        observed: format!("{rate:.1}%"),
        severity: Severity::High,
        spec_section: SECTION_TRAINING.to_string(),
        remediation: "Inspect failed attempts in the operation log; verify slot power, \
                      reference clock and firmware support for the reset methods used."
            .to_string(),
    })
}

fn check_error_rates(inputs: &ScoreInputs<'_>, limits: &ComplianceLimits) -> Vec<Violation> {
    let Some(deltas) = inputs.error_deltas else {
        return Vec::new();
    };
    CounterField::ALL
        .iter()
        .filter_map(|&field| {
            let delta = deltas.get(field);
            let rate = hourly_rate(delta, inputs.monitored);
            let ceiling = limits.errors.per_hour(field);
            (delta > 0 && rate > ceiling).then(|| Violation {
                requirement: format!("{field} stay below the hourly ceiling"),
                limit: format!("{ceiling:.1}/hour"),
                observed: format!("{rate:.1}/hour ({delta} total)"),
                severity: if field == CounterField::BadTlp {
                    Severity::High
                } else {
                    Severity::Medium
                },
                spec_section: SECTION_ERRORS.to_string(),
                remediation: "Check for marginal lanes (lane margining), connector seating \
                              and cable quality on the switch ports."
                    .to_string(),
            })
        })
        .collect()
}

fn check_degradation(degradation_events: usize, limits: &ComplianceLimits) -> Option<Violation> {
    (degradation_events > limits.max_degradation_events).then(|| Violation {
        requirement: "Negotiated link speed and width do not degrade".to_string(),
        limit: format!("{} events", limits.max_degradation_events),
        observed: format!("{degradation_events} events"),
        severity: Severity::High,
        spec_section: SECTION_LINK_STATUS.to_string(),
        remediation: "Compare current and maximum link speed/width; reseat the device and \
                      check for lanes failing to train."
            .to_string(),
    })
}

fn check_recovery(recoveries: &[RecoveryReport], limits: &ComplianceLimits) -> Option<Violation> {
    let failed: Vec<&RecoveryReport> = recoveries
        .iter()
        .filter(|r| r.non_recoverable || (!r.recovered && r.attempts >= limits.max_recovery_attempts))
        .collect();
    (!failed.is_empty()).then(|| Violation {
        requirement: "Devices recover within the retrain attempt limit".to_string(),
        limit: format!("{} attempts", limits.max_recovery_attempts),
        observed: failed
            .iter()
            .map(|r| format!("{} did not recover after {} attempts", r.device, r.attempts))
            .collect::<Vec<_>>()
            .join("; "),
        severity: Severity::Critical,
        spec_section: SECTION_TRAINING.to_string(),
        remediation: "Power cycle the affected slots and replace the device or cable if the \
                      link still fails to train."
            .to_string(),
    })
}

/// Score the session and check it against `limits`.
pub fn assess(
    inputs: &ScoreInputs<'_>,
    recoveries: &[RecoveryReport],
    degradation_events: usize,
    limits: &ComplianceLimits,
) -> ComplianceAssessment {
    let category_scores = score_categories(inputs, limits);
    let overall = overall_score(&category_scores);
    let grade = grade(overall);

    let mut violations = Vec::new();
    violations.extend(check_retrain_time(inputs, limits));
    violations.extend(check_success_rate(inputs, limits));
    violations.extend(check_error_rates(inputs, limits));
    violations.extend(check_degradation(degradation_events, limits));
    violations.extend(check_recovery(recoveries, limits));

    ComplianceAssessment {
        compliant: violations.is_empty(),
        category_scores,
        violations,
        overall_score: overall,
        grade,
        verdict: Verdict::from_grade(grade),
        success_rate: success_rate(inputs.operations),
        average_recovery_ms: average_recovery_ms(inputs.operations),
    }
}
