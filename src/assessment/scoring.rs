// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Category scores and the 1-25 grade.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use super::compliance::ComplianceLimits;
use super::events::{count_severity, QualityEvent, Severity};
use crate::counters::{CounterField, ErrorDeltas};
use crate::retrain::ResetOperation;

/// Lowest grade that passes.
pub const PASS_GRADE: u8 = 20;
/// Lowest grade that is a warning rather than a failure.
pub const WARNING_GRADE: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ResetReliability,
    RetrainTiming,
    ErrorRate,
    LinkStability,
    EventSeverity,
}

/// One category's score. `score` is `None` when the session produced no
/// data for the category; such categories do not count toward the average.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryScore {
    pub category: Category,
    pub score: Option<f64>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Warning,
    Fail,
}

impl Verdict {
    pub fn from_grade(grade: u8) -> Self {
        if grade >= PASS_GRADE {
            Verdict::Pass
        } else if grade >= WARNING_GRADE {
            Verdict::Warning
        } else {
            Verdict::Fail
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Verdict::Pass => "PASS",
            Verdict::Warning => "WARNING",
            Verdict::Fail => "FAIL",
        })
    }
}

fn clamp(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

/// Everything the scores are computed from.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs<'a> {
    pub operations: &'a [ResetOperation],
    pub error_deltas: Option<ErrorDeltas>,
    pub monitored: Duration,
    /// Whether any LTSSM tracker produced data.
    pub ltssm_data: bool,
    pub unexpected_transitions: usize,
    pub events: &'a [QualityEvent],
}

/// Percentage of successful resets; `None` without resets.
pub fn success_rate(operations: &[ResetOperation]) -> Option<f64> {
    if operations.is_empty() {
        return None;
    }
    let ok = operations.iter().filter(|op| op.success).count();
    Some(ok as f64 * 100.0 / operations.len() as f64)
}

/// Mean recovery time of successful resets.
pub fn average_recovery_ms(operations: &[ResetOperation]) -> Option<f64> {
    let times: Vec<f64> = operations
        .iter()
        .filter(|op| op.success)
        .filter_map(|op| op.recovery_time_ms)
        .collect();
    if times.is_empty() {
        None
    } else {
        Some(times.iter().sum::<f64>() / times.len() as f64)
    }
}

/// Counter increase per hour of monitoring.
pub fn hourly_rate(delta: u64, monitored: Duration) -> f64 {
    let hours = monitored.as_secs_f64() / 3600.0;
    if hours <= 0.0 {
        0.0
    } else {
        delta as f64 / hours
    }
}

pub fn score_categories(inputs: &ScoreInputs<'_>, limits: &ComplianceLimits) -> Vec<CategoryScore> {
    let mut scores = Vec::with_capacity(5);

    let rate = success_rate(inputs.operations);
    scores.push(CategoryScore {
        category: Category::ResetReliability,
        score: rate.map(clamp),
        detail: match rate {
            Some(r) => format!("{r:.1}% of {} resets succeeded", inputs.operations.len()),
            None => "no resets performed".to_string(),
        },
    });

    let avg = average_recovery_ms(inputs.operations);
    let limit_ms = limits.max_retrain_time_ms as f64;
    scores.push(CategoryScore {
        category: Category::RetrainTiming,
        score: avg.map(|avg| clamp(100.0 - 50.0 * avg / limit_ms)),
        detail: match avg {
            Some(avg) => format!("average recovery {avg:.1}ms against a {limit_ms:.0}ms limit"),
            None => "no completed resets".to_string(),
        },
    });

    let worst = inputs.error_deltas.map(|deltas| {
        CounterField::ALL
            .iter()
            .map(|&field| {
                let rate = hourly_rate(deltas.get(field), inputs.monitored);
                let ceiling = limits.errors.per_hour(field);
                let ratio = if ceiling > 0.0 {
                    rate / ceiling
                } else if rate > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                };
                (field, ratio)
            })
            .fold((CounterField::PortReceive, 0.0), |a, b| if b.1 > a.1 { b } else { a })
    });
    scores.push(CategoryScore {
        category: Category::ErrorRate,
        score: worst.map(|(_, ratio)| clamp(100.0 - 50.0 * ratio)),
        detail: match worst {
            Some((_, ratio)) if ratio == 0.0 => "no counter increases".to_string(),
            Some((field, ratio)) => format!("{field} at {:.0}% of the hourly ceiling", ratio * 100.0),
            None => "no error counter data".to_string(),
        },
    });

    scores.push(CategoryScore {
        category: Category::LinkStability,
        score: inputs
            .ltssm_data
            .then(|| clamp(100.0 - 10.0 * inputs.unexpected_transitions as f64)),
        detail: if inputs.ltssm_data {
            format!("{} unexpected disruptive transitions", inputs.unexpected_transitions)
        } else {
            "no LTSSM data".to_string()
        },
    });

    let count = |s| count_severity(inputs.events, s) as f64;
    let (critical, high, medium, low) = (
        count(Severity::Critical),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low),
    );
    scores.push(CategoryScore {
        category: Category::EventSeverity,
        score: Some(clamp(
            100.0 - 25.0 * critical - 10.0 * high - 5.0 * medium - low,
        )),
        detail: format!("{critical} critical, {high} high, {medium} medium, {low} low events"),
    });

    scores
}

/// Mean of the categories that have data.
pub fn overall_score(scores: &[CategoryScore]) -> f64 {
    let present: Vec<f64> = scores.iter().filter_map(|s| s.score).collect();
    if present.is_empty() {
        0.0
    } else {
        present.iter().sum::<f64>() / present.len() as f64
    }
}

/// Map a 0-100 score onto 1-25.
pub fn grade(overall: f64) -> u8 {
    (1.0 + (clamp(overall) * 24.0 / 100.0).round()) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_bounds() {
        assert_eq!(grade(0.0), 1);
        assert_eq!(grade(100.0), 25);
        assert_eq!(grade(150.0), 25);
        assert_eq!(grade(-3.0), 1);
        assert_eq!(Verdict::from_grade(grade(80.0)), Verdict::Pass);
        assert_eq!(Verdict::from_grade(grade(60.0)), Verdict::Warning);
        assert_eq!(Verdict::from_grade(grade(50.0)), Verdict::Fail);
    }

    #[test]
    fn missing_categories_do_not_drag_the_average() {
        let inputs = ScoreInputs {
            operations: &[],
            error_deltas: Some(ErrorDeltas::default()),
            monitored: Duration::from_secs(60),
            ltssm_data: true,
            unexpected_transitions: 0,
            events: &[],
        };
        let scores = score_categories(&inputs, &ComplianceLimits::default());
        assert_eq!(scores.len(), 5);
        assert_eq!(scores[0].score, None);
        assert_eq!(scores[1].score, None);
        assert_eq!(overall_score(&scores), 100.0);
        assert_eq!(grade(overall_score(&scores)), 25);
    }

    #[test]
    fn error_rate_scales_with_ceiling() {
        let inputs = ScoreInputs {
            operations: &[],
            error_deltas: Some(ErrorDeltas {
                port_receive: 10,
                ..ErrorDeltas::default()
            }),
            monitored: Duration::from_secs(3600),
            ltssm_data: false,
            unexpected_transitions: 0,
            events: &[],
        };
        let scores = score_categories(&inputs, &ComplianceLimits::default());
        assert_eq!(scores[2].score, Some(50.0));
        assert_eq!(scores[3].score, None);
    }
}
