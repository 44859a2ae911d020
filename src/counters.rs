// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Switch error counters: parsing the switch's free-form status text and
//! sampling it in the background.
//!
//! The counters are cumulative since the switch powered up. Nothing here
//! reports raw values as error counts; analysis always diffs against a
//! stored baseline.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::Error;
use crate::host::{command_stdout, HostCommandSpec, DEFAULT_COMMAND_TIMEOUT};
use crate::session::{SamplingLoop, SessionResult, DEFAULT_STOP_TIMEOUT};

/// Read-only status query understood by the switch firmware.
pub const DEFAULT_COUNTER_COMMAND: &str = "show errors";

/// One of the four counters the switch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterField {
    PortReceive,
    BadTlp,
    BadDllp,
    RecDiag,
}

impl CounterField {
    pub const ALL: [CounterField; 4] = [
        CounterField::PortReceive,
        CounterField::BadTlp,
        CounterField::BadDllp,
        CounterField::RecDiag,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CounterField::PortReceive => "port receive errors",
            CounterField::BadTlp => "bad TLPs",
            CounterField::BadDllp => "bad DLLPs",
            CounterField::RecDiag => "recovery diagnostic events",
        }
    }
}

impl fmt::Display for CounterField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Candidate label spellings per field, tried in order. New firmware
// spellings go here.
const COUNTER_LABELS: &[(CounterField, &[&str])] = &[
    (
        CounterField::PortReceive,
        &[
            r"port[ _-]?receive(?:[ _-]?err(?:or)?s?)?",
            r"port[ _-]?rx[ _-]?err(?:or)?s?",
            r"receiver[ _-]?err(?:or)?s?",
            r"rx[ _-]?err(?:or)?s?",
        ],
    ),
    (
        CounterField::BadTlp,
        &[r"bad[ _-]?tlps?(?:[ _-]?count)?", r"tlp[ _-]?err(?:or)?s?"],
    ),
    (
        CounterField::BadDllp,
        &[r"bad[ _-]?dllps?(?:[ _-]?count)?", r"dllp[ _-]?err(?:or)?s?"],
    ),
    (
        CounterField::RecDiag,
        &[
            r"rec(?:overy)?[ _-]?diag(?:nostics?)?(?:[ _-]?events?)?",
            r"recovery[ _-]?(?:count|events?)",
        ],
    ),
];

// Label, then `:`, `=` or plain whitespace, then a decimal or hex value.
const VALUE_SUFFIX: &str = r"\s*(?:[:=]\s*|\s+)(0x[0-9a-f]+|\d+)\b";

fn counter_patterns() -> &'static [(CounterField, Vec<Regex>)] {
    static PATTERNS: OnceLock<Vec<(CounterField, Vec<Regex>)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        COUNTER_LABELS
            .iter()
            .map(|(field, labels)| {
                let regexes = labels
                    .iter()
                    .filter_map(|label| Regex::new(&format!(r"(?i)\b{label}{VALUE_SUFFIX}")).ok())
                    .collect();
                (*field, regexes)
            })
            .collect()
    })
}

fn parse_value(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Find `field` in `text`, trying each label spelling in turn.
pub fn find_counter(text: &str, field: CounterField) -> Option<u64> {
    let (_, regexes) = counter_patterns().iter().find(|(f, _)| *f == field)?;
    regexes
        .iter()
        .find_map(|re| re.captures(text).and_then(|c| parse_value(&c[1])))
}

/// One reading of the cumulative counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorSample {
    pub timestamp: DateTime<Utc>,
    pub port_receive: u64,
    pub bad_tlp: u64,
    pub bad_dllp: u64,
    pub rec_diag: u64,
}

impl ErrorSample {
    /// Parse a status response. All four counters must be present.
    pub fn parse(text: &str, timestamp: DateTime<Utc>) -> Result<Self, Error> {
        let mut values = [0u64; 4];
        let mut missing = Vec::new();
        for (slot, field) in values.iter_mut().zip(CounterField::ALL) {
            match find_counter(text, field) {
                Some(v) => *slot = v,
                None => missing.push(field.name()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::CounterParse(missing.join(", ")));
        }
        let [port_receive, bad_tlp, bad_dllp, rec_diag] = values;
        Ok(Self {
            timestamp,
            port_receive,
            bad_tlp,
            bad_dllp,
            rec_diag,
        })
    }

    pub fn get(&self, field: CounterField) -> u64 {
        match field {
            CounterField::PortReceive => self.port_receive,
            CounterField::BadTlp => self.bad_tlp,
            CounterField::BadDllp => self.bad_dllp,
            CounterField::RecDiag => self.rec_diag,
        }
    }
}

/// Per-counter increase between two samples. Never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorDeltas {
    pub port_receive: u64,
    pub bad_tlp: u64,
    pub bad_dllp: u64,
    pub rec_diag: u64,
}

impl ErrorDeltas {
    /// `later - earlier` per counter. A counter that went backwards (rollover
    /// or a stale baseline) is clamped to zero and reported in the warnings.
    pub fn between(earlier: &ErrorSample, later: &ErrorSample) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut diff = |field: CounterField| {
            let (a, b) = (earlier.get(field), later.get(field));
            if b < a {
                warnings.push(format!(
                    "{field} counter went backwards ({a} -> {b}); treating as rollover"
                ));
            }
            b.saturating_sub(a)
        };
        let deltas = Self {
            port_receive: diff(CounterField::PortReceive),
            bad_tlp: diff(CounterField::BadTlp),
            bad_dllp: diff(CounterField::BadDllp),
            rec_diag: diff(CounterField::RecDiag),
        };
        (deltas, warnings)
    }

    pub fn get(&self, field: CounterField) -> u64 {
        match field {
            CounterField::PortReceive => self.port_receive,
            CounterField::BadTlp => self.bad_tlp,
            CounterField::BadDllp => self.bad_dllp,
            CounterField::RecDiag => self.rec_diag,
        }
    }

    pub fn total(&self) -> u64 {
        self.port_receive
            .saturating_add(self.bad_tlp)
            .saturating_add(self.bad_dllp)
            .saturating_add(self.rec_diag)
    }
}

/// The command link to the switch's management CPU.
pub trait SwitchCommandChannel: Send + Sync {
    fn query(&self, command: &str) -> Result<String, Error>;
}

/// Runs a vendor CLI once per query: `<program> <args...> <command>`.
#[derive(Debug, Clone)]
pub struct ProcessCommandChannel {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessCommandChannel {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl SwitchCommandChannel for ProcessCommandChannel {
    fn query(&self, command: &str) -> Result<String, Error> {
        let mut args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        args.push(command);
        command_stdout(HostCommandSpec::new(&self.program, &args).with_timeout(self.timeout))
    }
}

/// The sealed counter timeline and the baseline/final comparison.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorCounterResult {
    pub session: SessionResult<ErrorSample>,
    pub baseline: Option<ErrorSample>,
    pub final_sample: Option<ErrorSample>,
    /// `None` without both a baseline and a final sample.
    pub deltas: Option<ErrorDeltas>,
}

/// Polls the switch counters on a background thread.
pub struct ErrorCounterSampler {
    channel: Arc<dyn SwitchCommandChannel>,
    command: String,
    stop_timeout: Duration,
    latest: Arc<Mutex<Option<ErrorSample>>>,
    baseline: Option<ErrorSample>,
    start_warnings: Vec<String>,
    active: Option<SamplingLoop<ErrorSample>>,
}

fn take_sample(channel: &dyn SwitchCommandChannel, command: &str) -> Result<ErrorSample, Error> {
    let text = channel.query(command)?;
    ErrorSample::parse(&text, Utc::now())
}

impl ErrorCounterSampler {
    pub fn new(channel: Arc<dyn SwitchCommandChannel>) -> Self {
        Self {
            channel,
            command: DEFAULT_COUNTER_COMMAND.to_string(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            latest: Arc::new(Mutex::new(None)),
            baseline: None,
            start_warnings: Vec::new(),
            active: None,
        }
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = command.to_string();
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().map_or(false, |l| l.is_running())
    }

    /// The most recent successful sample, if any.
    pub fn current_counters(&self) -> Option<ErrorSample> {
        *self.latest.lock()
    }

    pub fn start(&mut self, interval: Duration) -> Result<(), Error> {
        if self.active.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.start_warnings.clear();
        self.baseline = match take_sample(self.channel.as_ref(), &self.command) {
            Ok(sample) => Some(sample),
            Err(e) => {
                tracing::warn!("no baseline error counter sample: {e}");
                self.start_warnings
                    .push(format!("baseline error counter sample unavailable: {e}"));
                None
            }
        };
        *self.latest.lock() = self.baseline;

        let channel = Arc::clone(&self.channel);
        let command = self.command.clone();
        let latest = Arc::clone(&self.latest);
        let mut warned = false;
        let sampler = SamplingLoop::spawn("error-counters", interval, move || {
            match take_sample(channel.as_ref(), &command) {
                Ok(sample) => {
                    *latest.lock() = Some(sample);
                    vec![sample]
                }
                Err(e) => {
                    if warned {
                        tracing::debug!("error counter query failed: {e}");
                    } else {
                        warned = true;
                        tracing::warn!("error counter query failed: {e}");
                    }
                    Vec::new()
                }
            }
        })?;
        tracing::info!(interval = ?interval, command = %self.command, "error counter sampling started");
        self.active = Some(sampler);
        Ok(())
    }

    /// Stop sampling, take a final sample and compute `final - baseline`.
    pub fn stop(&mut self) -> Result<ErrorCounterResult, Error> {
        let sampler = self.active.take().ok_or(Error::NotRunning)?;
        let mut session = sampler.stop(self.stop_timeout);
        let mut warnings = std::mem::take(&mut self.start_warnings);
        warnings.append(&mut session.warnings);
        session.warnings = warnings;

        let final_sample = match take_sample(self.channel.as_ref(), &self.command) {
            Ok(sample) => {
                *self.latest.lock() = Some(sample);
                Some(sample)
            }
            Err(e) => {
                tracing::warn!("no final error counter sample: {e}");
                session
                    .warnings
                    .push(format!("final error counter sample unavailable: {e}"));
                None
            }
        };

        let records = &mut session.session.records;
        if let Some(baseline) = self.baseline {
            records.insert(0, baseline);
        }
        records.extend(final_sample);
        records.sort_by_key(|s| s.timestamp);
        session.monitoring_successful = !records.is_empty();

        let deltas = match (self.baseline, final_sample) {
            (Some(baseline), Some(last)) => {
                let (deltas, warnings) = ErrorDeltas::between(&baseline, &last);
                for w in &warnings {
                    tracing::warn!("{w}");
                }
                session.warnings.extend(warnings);
                Some(deltas)
            }
            _ => None,
        };
        tracing::info!(samples = session.session.records.len(), "error counter sampling stopped");
        Ok(ErrorCounterResult {
            session,
            baseline: self.baseline,
            final_sample,
            deltas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    fn parse(text: &str) -> (u64, u64, u64, u64) {
        let s = ErrorSample::parse(text, Utc::now()).unwrap();
        (s.port_receive, s.bad_tlp, s.bad_dllp, s.rec_diag)
    }

    #[test]
    fn parses_every_layout() {
        let expected = (123, 456, 789, 12);
        assert_eq!(parse("Port Receive: 123, BadTLP: 456, BadDLLP: 789, RecDiag: 12"), expected);
        assert_eq!(parse("Port Receive=123, BadTLP=456, BadDLLP=789, RecDiag=12"), expected);
        assert_eq!(parse("Port Receive: 123\nBadTLP: 456\nBadDLLP: 789\nRecDiag: 12\n"), expected);
    }

    #[test]
    fn parses_label_variants_and_hex() {
        let text = "\
port_rx_errors   0x7b
bad_tlp_count    456
Bad DLLPs        789
Recovery Diagnostics Events = 12
";
        assert_eq!(parse(text), (123, 456, 789, 12));
    }

    #[test]
    fn missing_counter_is_an_error() {
        let err = ErrorSample::parse("Port Receive: 1, BadTLP: 2", Utc::now()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bad DLLPs"));
        assert!(message.contains("recovery diagnostic events"));
    }

    fn sample(values: [u64; 4]) -> ErrorSample {
        ErrorSample {
            timestamp: Utc::now(),
            port_receive: values[0],
            bad_tlp: values[1],
            bad_dllp: values[2],
            rec_diag: values[3],
        }
    }

    #[test]
    fn deltas_never_negative() {
        for (a, b) in [(0u64, 5u64), (5, 0), (u64::MAX, 0), (7, 7)] {
            let (d, warnings) = ErrorDeltas::between(&sample([a; 4]), &sample([b; 4]));
            for field in CounterField::ALL {
                assert_eq!(d.get(field), b.saturating_sub(a));
            }
            assert_eq!(warnings.len(), if b < a { 4 } else { 0 });
        }
    }

    struct Incrementing(AtomicU64);

    impl SwitchCommandChannel for Incrementing {
        fn query(&self, command: &str) -> Result<String, Error> {
            assert_eq!(command, DEFAULT_COUNTER_COMMAND);
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("Port Receive: {n}, BadTLP: 0, BadDLLP: 0, RecDiag: {n}"))
        }
    }

    struct Broken;

    impl SwitchCommandChannel for Broken {
        fn query(&self, _command: &str) -> Result<String, Error> {
            Err(Error::CommandChannel("serial port closed".to_string()))
        }
    }

    #[test]
    fn sampler_reports_baseline_deltas() {
        let mut sampler = ErrorCounterSampler::new(Arc::new(Incrementing(AtomicU64::new(10))));
        sampler.start(Duration::from_millis(5)).unwrap();
        assert!(matches!(sampler.start(Duration::from_millis(5)), Err(Error::AlreadyRunning)));
        thread::sleep(Duration::from_millis(40));
        assert!(sampler.current_counters().is_some());
        let result = sampler.stop().unwrap();
        let baseline = result.baseline.unwrap();
        let last = result.final_sample.unwrap();
        assert_eq!(baseline.port_receive, 10);
        assert_eq!(result.deltas.unwrap().port_receive, last.port_receive - 10);
        assert!(result.session.monitoring_successful);
        assert!(result.session.warnings.is_empty());
        let records = result.session.records();
        assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn missing_baseline_is_a_warning() {
        let mut sampler = ErrorCounterSampler::new(Arc::new(Broken));
        sampler.start(Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(15));
        let result = sampler.stop().unwrap();
        assert!(result.deltas.is_none());
        assert!(!result.session.monitoring_successful);
        assert_eq!(result.session.warnings.len(), 2);
        assert!(matches!(sampler.stop(), Err(Error::NotRunning)));
    }
}
