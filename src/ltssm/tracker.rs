// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background LTSSM tracking for one device.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::{LtssmState, LtssmTransition, ObservationSource, StateSource};
use crate::error::Error;
use crate::kernel_log::{classify, mentions, LogQuery};
use crate::pcie::Bdf;
use crate::session::{SamplingLoop, SessionResult, DEFAULT_STOP_TIMEOUT};

/// Ask each source in order, stopping at the first that knows the state.
/// `on_error` sees every source that failed along the way, by index.
pub fn sample_chain<F>(
    sources: &[Box<dyn StateSource>],
    bdf: &Bdf,
    mut on_error: F,
) -> Option<(LtssmState, ObservationSource)>
where
    F: FnMut(usize, &dyn StateSource, &Error),
{
    for (index, source) in sources.iter().enumerate() {
        match source.query(bdf) {
            Ok(LtssmState::Unknown) => continue,
            Ok(state) => return Some((state, source.source())),
            Err(e) => on_error(index, source.as_ref(), &e),
        }
    }
    None
}

fn millis_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0
}

/// Re-derive each record's `from` and dwell time from the record before it,
/// dropping records that no longer change state. Records must be sorted.
fn rechain(records: &mut Vec<LtssmTransition>) {
    let mut chained: Vec<LtssmTransition> = Vec::with_capacity(records.len());
    for mut transition in std::mem::take(records) {
        if let Some(prior) = chained.last() {
            transition.from = prior.to;
            transition.duration_ms = Some(millis_between(prior.timestamp, transition.timestamp));
        }
        if transition.from != transition.to {
            chained.push(transition);
        }
    }
    *records = chained;
}

type TransitionCallback = Box<dyn Fn(&LtssmTransition) + Send>;

/// Samples one device's training state on a background thread and records
/// every change.
pub struct LtssmTracker {
    device: Bdf,
    sources: Arc<Vec<Box<dyn StateSource>>>,
    logs: Option<Arc<dyn LogQuery>>,
    aliases: Vec<Bdf>,
    stop_timeout: Duration,
    current: Arc<Mutex<LtssmState>>,
    active: Option<SamplingLoop<LtssmTransition>>,
}

impl LtssmTracker {
    /// `sources` are tried in the given order on every sample.
    pub fn new(device: Bdf, sources: Vec<Box<dyn StateSource>>) -> Self {
        Self {
            device,
            sources: Arc::new(sources),
            logs: None,
            aliases: Vec::new(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            current: Arc::new(Mutex::new(LtssmState::Unknown)),
            active: None,
        }
    }

    /// Merge kernel-log link messages naming the device (or any of
    /// `aliases`, typically its upstream port) when the tracker stops.
    pub fn with_kernel_log(mut self, logs: Arc<dyn LogQuery>, aliases: Vec<Bdf>) -> Self {
        self.logs = Some(logs);
        self.aliases = aliases;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn device(&self) -> Bdf {
        self.device
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().map_or(false, |l| l.is_running())
    }

    /// The most recently sampled state; `Unknown` when no source answered.
    pub fn current_state(&self) -> LtssmState {
        *self.current.lock()
    }

    pub fn start(
        &mut self,
        interval: Duration,
        on_transition: Option<TransitionCallback>,
    ) -> Result<(), Error> {
        if self.active.is_some() {
            return Err(Error::AlreadyRunning);
        }
        *self.current.lock() = LtssmState::Unknown;

        let device = self.device;
        let sources = Arc::clone(&self.sources);
        let current = Arc::clone(&self.current);
        let mut warned = vec![false; sources.len()];
        let mut previous = LtssmState::Unknown;
        let mut previous_at: Option<DateTime<Utc>> = None;

        let sampler = SamplingLoop::spawn("ltssm-tracker", interval, move || {
            let observed = sample_chain(&sources, &device, |index, source, e| {
                if warned[index] {
                    tracing::debug!(device = %device, source = ?source.source(), "state source failed: {e}");
                } else {
                    warned[index] = true;
                    tracing::warn!(device = %device, source = ?source.source(), "state source failed: {e}");
                }
            });
            let Some((state, source)) = observed else {
                *current.lock() = LtssmState::Unknown;
                return Vec::new();
            };
            *current.lock() = state;
            if state == previous {
                return Vec::new();
            }

            let now = Utc::now();
            let transition = LtssmTransition {
                timestamp: now,
                device,
                source,
                from: previous,
                to: state,
                duration_ms: previous_at.map(|at| millis_between(at, now)),
            };
            tracing::debug!(device = %device, from = %previous, to = %state, "LTSSM transition");
            previous = state;
            previous_at = Some(now);
            if let Some(callback) = &on_transition {
                callback(&transition);
            }
            vec![transition]
        })?;
        tracing::info!(device = %self.device, interval = ?interval, "LTSSM tracking started");
        self.active = Some(sampler);
        Ok(())
    }

    /// Stop sampling, fold in kernel-log transitions logged since start and
    /// return the timeline sorted by timestamp.
    pub fn stop(&mut self) -> Result<SessionResult<LtssmTransition>, Error> {
        let sampler = self.active.take().ok_or(Error::NotRunning)?;
        let started_at = sampler.started_at();
        let mut result = sampler.stop(self.stop_timeout);

        if let Some(logs) = &self.logs {
            match logs.recent_kernel_lines(Some(started_at)) {
                Ok(lines) => {
                    let mut lines = lines;
                    lines.sort_by_key(|l| l.timestamp);
                    let records = &mut result.session.records;
                    records.sort_by_key(|t| t.timestamp);
                    for line in lines.iter().filter(|l| l.timestamp >= started_at) {
                        let named = mentions(&line.text, &self.device)
                            || self.aliases.iter().any(|a| mentions(&line.text, a));
                        if !named {
                            continue;
                        }
                        let Some(to) = classify(&line.text).and_then(|e| e.implied_state()) else {
                            continue;
                        };
                        let at = records.partition_point(|t| t.timestamp <= line.timestamp);
                        let prior = at.checked_sub(1).map(|i| &records[i]);
                        let from = prior.map_or(LtssmState::Unknown, |t| t.to);
                        if from == to {
                            continue;
                        }
                        let transition = LtssmTransition {
                            timestamp: line.timestamp,
                            device: self.device,
                            source: ObservationSource::KernelLog,
                            from,
                            to,
                            duration_ms: prior.map(|t| millis_between(t.timestamp, line.timestamp)),
                        };
                        records.insert(at, transition);
                    }
                }
                Err(e) => {
                    tracing::warn!(device = %self.device, "kernel log unavailable: {e}");
                    result.warnings.push(format!("kernel log query failed: {e}"));
                }
            }
        }

        result.session.records.sort_by_key(|t| t.timestamp);
        rechain(&mut result.session.records);
        result.monitoring_successful = !result.session.records.is_empty();
        tracing::info!(
            device = %self.device,
            transitions = result.session.records.len(),
            "LTSSM tracking stopped"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_log::KernelLine;
    use std::collections::VecDeque;
    use std::thread;

    /// Replays a script of answers, repeating the last one forever.
    struct Scripted {
        kind: ObservationSource,
        script: Mutex<VecDeque<Result<LtssmState, ()>>>,
    }

    impl Scripted {
        fn new(kind: ObservationSource, script: Vec<Result<LtssmState, ()>>) -> Box<Self> {
            Box::new(Self {
                kind,
                script: Mutex::new(script.into()),
            })
        }
    }

    impl StateSource for Scripted {
        fn source(&self) -> ObservationSource {
            self.kind
        }

        fn query(&self, _bdf: &Bdf) -> Result<LtssmState, Error> {
            let mut script = self.script.lock();
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            match next {
                Some(Ok(state)) => Ok(state),
                _ => Err(Error::CommandChannel("scripted failure".to_string())),
            }
        }
    }

    struct FixedLog(Vec<KernelLine>);

    impl LogQuery for FixedLog {
        fn recent_kernel_lines(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<KernelLine>, Error> {
            Ok(self.0.clone())
        }
    }

    const DEVICE: Bdf = Bdf {
        domain: 0,
        bus: 3,
        device: 0,
        function: 0,
    };

    #[test]
    fn chain_falls_through_failures_and_unknown() {
        let sources: Vec<Box<dyn StateSource>> = vec![
            Scripted::new(ObservationSource::Sysfs, vec![Err(())]),
            Scripted::new(ObservationSource::RegisterPoll, vec![Ok(LtssmState::Unknown)]),
            Scripted::new(ObservationSource::ToolQuery, vec![Ok(LtssmState::L0)]),
        ];
        let mut failed = Vec::new();
        let found = sample_chain(&sources, &DEVICE, |i, _, _| failed.push(i));
        assert_eq!(found, Some((LtssmState::L0, ObservationSource::ToolQuery)));
        assert_eq!(failed, vec![0]);
    }

    #[test]
    fn records_only_changes() {
        let script = vec![
            Ok(LtssmState::L0),
            Ok(LtssmState::L0),
            Ok(LtssmState::Recovery),
            Ok(LtssmState::Recovery),
            Ok(LtssmState::L0),
        ];
        let mut tracker = LtssmTracker::new(
            DEVICE,
            vec![Scripted::new(ObservationSource::RegisterPoll, script)],
        );
        tracker.start(Duration::from_millis(2), None).unwrap();
        assert!(matches!(
            tracker.start(Duration::from_millis(2), None),
            Err(Error::AlreadyRunning)
        ));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(tracker.current_state(), LtssmState::L0);
        let result = tracker.stop().unwrap();
        let seen: Vec<_> = result.records().iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            seen,
            vec![
                (LtssmState::Unknown, LtssmState::L0),
                (LtssmState::L0, LtssmState::Recovery),
                (LtssmState::Recovery, LtssmState::L0),
            ]
        );
        assert!(result.records()[0].duration_ms.is_none());
        assert!(result.records()[1].duration_ms.is_some());
        assert!(matches!(tracker.stop(), Err(Error::NotRunning)));
    }

    #[test]
    fn all_sources_failing_degrades_to_unknown() {
        let mut tracker = LtssmTracker::new(
            DEVICE,
            vec![Scripted::new(ObservationSource::Sysfs, vec![Err(())])],
        );
        tracker.start(Duration::from_millis(2), None).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(tracker.is_running());
        assert_eq!(tracker.current_state(), LtssmState::Unknown);
        let result = tracker.stop().unwrap();
        assert!(result.records().is_empty());
        assert!(!result.monitoring_successful);
    }

    #[test]
    fn callback_sees_each_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut tracker = LtssmTracker::new(
            DEVICE,
            vec![Scripted::new(
                ObservationSource::Sysfs,
                vec![Ok(LtssmState::Detect), Ok(LtssmState::L0)],
            )],
        );
        tracker
            .start(
                Duration::from_millis(2),
                Some(Box::new(move |t: &LtssmTransition| sink.lock().push(t.to))),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        tracker.stop().unwrap();
        assert_eq!(*seen.lock(), vec![LtssmState::Detect, LtssmState::L0]);
    }

    #[test]
    fn kernel_log_lines_merge_in_order() {
        let now = Utc::now();
        let logs = Arc::new(FixedLog(vec![
            KernelLine {
                timestamp: now + chrono::Duration::milliseconds(40),
                text: "pcieport 0000:02:00.0: pciehp: Slot(3): Link Down".to_string(),
            },
            KernelLine {
                timestamp: now + chrono::Duration::milliseconds(45),
                text: "nvme 0000:05:00.0: link down".to_string(),
            },
            KernelLine {
                timestamp: now - chrono::Duration::seconds(60),
                text: "pcieport 0000:02:00.0: Link Down".to_string(),
            },
        ]));
        let mut tracker = LtssmTracker::new(
            DEVICE,
            vec![Scripted::new(ObservationSource::RegisterPoll, vec![Ok(LtssmState::L0)])],
        )
        .with_kernel_log(logs, vec![Bdf::new(0, 2, 0, 0)]);
        tracker.start(Duration::from_millis(2), None).unwrap();
        thread::sleep(Duration::from_millis(20));
        let result = tracker.stop().unwrap();
        let records = result.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].source, ObservationSource::KernelLog);
        assert_eq!((records[1].from, records[1].to), (LtssmState::L0, LtssmState::Detect));
        assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    fn record(ms: i64, source: ObservationSource, from: LtssmState, to: LtssmState) -> LtssmTransition {
        LtssmTransition {
            timestamp: DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::milliseconds(ms),
            device: DEVICE,
            source,
            from,
            to,
            duration_ms: None,
        }
    }

    #[test]
    fn log_line_between_samples_splits_the_chain() {
        use LtssmState::*;
        let mut records = vec![
            record(0, ObservationSource::RegisterPoll, Unknown, L0),
            record(10, ObservationSource::KernelLog, L0, Detect),
            record(30, ObservationSource::RegisterPoll, L0, Recovery),
        ];
        rechain(&mut records);
        let seen: Vec<_> = records.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(seen, vec![(Unknown, L0), (L0, Detect), (Detect, Recovery)]);
        assert_eq!(records[2].duration_ms, Some(20.0));
        assert!(records[0].duration_ms.is_none());
    }

    #[test]
    fn sample_repeating_a_logged_state_is_dropped() {
        use LtssmState::*;
        let mut records = vec![
            record(0, ObservationSource::RegisterPoll, Unknown, L0),
            record(10, ObservationSource::KernelLog, L0, Detect),
            record(15, ObservationSource::RegisterPoll, L0, Detect),
            record(40, ObservationSource::RegisterPoll, Detect, L0),
        ];
        rechain(&mut records);
        let seen: Vec<_> = records.iter().map(|t| (t.source, t.to)).collect();
        assert_eq!(
            seen,
            vec![
                (ObservationSource::RegisterPoll, L0),
                (ObservationSource::KernelLog, Detect),
                (ObservationSource::RegisterPoll, L0),
            ]
        );
        assert_eq!(records[2].from, Detect);
        assert_eq!(records[2].duration_ms, Some(30.0));
    }
}
