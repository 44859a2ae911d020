// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monitoring sessions and the background sampling loop shared by the LTSSM
//! tracker and the error counter sampler.
//!
//! A loop owns nothing but its own iteration state. Every record it produces
//! is sent over a channel to the [`SamplingLoop`] handle, so a stop that times
//! out still drains everything collected up to that point. A single mutex
//! guards the `running` / `stop_requested` flags.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Error;

/// Default budget for a loop to notice a stop request and exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// The records of one tracker or sampler run. Sealed when the run stops.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSession<T> {
    pub started_at: DateTime<Utc>,
    /// `None` while the session is active.
    pub ended_at: Option<DateTime<Utc>>,
    pub records: Vec<T>,
    #[serde(serialize_with = "serialize_millis")]
    pub interval: Duration,
    pub running: bool,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// A sealed session, plus how the run went.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResult<T> {
    pub session: MonitoringSession<T>,
    /// False when the run produced no records at all.
    pub monitoring_successful: bool,
    /// True when the loop did not exit within the stop timeout.
    pub stop_timed_out: bool,
    pub warnings: Vec<String>,
}

impl<T> SessionResult<T> {
    pub fn records(&self) -> &[T] {
        &self.session.records
    }
}

#[derive(Debug, Default)]
struct LoopFlags {
    running: bool,
    stop_requested: bool,
}

#[derive(Debug, Default)]
struct LoopControl {
    flags: Mutex<LoopFlags>,
    changed: Condvar,
}

impl LoopControl {
    /// Sleep for `interval`, waking early on a stop request. Returns true if
    /// the loop should exit.
    fn wait_interval(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        let mut flags = self.flags.lock();
        while !flags.stop_requested {
            if self.changed.wait_until(&mut flags, deadline).timed_out() {
                break;
            }
        }
        flags.stop_requested
    }

    fn stop_requested(&self) -> bool {
        self.flags.lock().stop_requested
    }

    fn mark_exited(&self) {
        self.flags.lock().running = false;
        self.changed.notify_all();
    }
}

/// Handle to one running background loop producing records of type `T`.
pub struct SamplingLoop<T> {
    control: Arc<LoopControl>,
    records: mpsc::Receiver<T>,
    thread: Option<thread::JoinHandle<()>>,
    started_at: DateTime<Utc>,
    interval: Duration,
}

impl<T: Send + 'static> SamplingLoop<T> {
    /// Spawn a loop that calls `sample` immediately and then once per
    /// `interval` until stopped. Every record `sample` returns is delivered
    /// to the handle.
    pub fn spawn<F>(name: &str, interval: Duration, mut sample: F) -> Result<Self, Error>
    where
        F: FnMut() -> Vec<T> + Send + 'static,
    {
        let control = Arc::new(LoopControl::default());
        control.flags.lock().running = true;
        let (tx, rx) = mpsc::channel();
        let loop_control = Arc::clone(&control);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    if loop_control.stop_requested() {
                        break;
                    }
                    for record in sample() {
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    if loop_control.wait_interval(interval) {
                        break;
                    }
                }
                loop_control.mark_exited();
            });
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                control.flags.lock().running = false;
                return Err(e.into());
            }
        };
        Ok(Self {
            control,
            records: rx,
            thread: Some(thread),
            started_at: Utc::now(),
            interval,
        })
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_running(&self) -> bool {
        self.control.flags.lock().running
    }

    /// Two-phase stop: request the loop to exit, then wait up to `timeout`
    /// for it to do so. Returns the sealed session either way.
    pub fn stop(mut self, timeout: Duration) -> SessionResult<T> {
        let deadline = Instant::now() + timeout;
        let timed_out = {
            let mut flags = self.control.flags.lock();
            flags.stop_requested = true;
            self.control.changed.notify_all();
            while flags.running {
                if self.control.changed.wait_until(&mut flags, deadline).timed_out() {
                    break;
                }
            }
            flags.running
        };

        let mut warnings = Vec::new();
        if timed_out {
            // The thread is left to finish its in-flight call and exit on
            // its own; it can no longer deliver records to anyone.
            tracing::warn!(timeout = ?timeout, "sampling loop did not stop in time");
            warnings.push(format!(
                "sampling loop did not stop within {}ms; returning partial data",
                timeout.as_millis()
            ));
            self.thread.take();
        } else if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        let records: Vec<T> = self.records.try_iter().collect();
        SessionResult {
            monitoring_successful: !records.is_empty(),
            stop_timed_out: timed_out,
            warnings,
            session: MonitoringSession {
                started_at: self.started_at,
                ended_at: Some(Utc::now()),
                records,
                interval: self.interval,
                running: false,
            },
        }
    }
}

impl<T> Drop for SamplingLoop<T> {
    fn drop(&mut self) {
        let mut flags = self.control.flags.lock();
        flags.stop_requested = true;
        self.control.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn collects_records_until_stopped() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let sampler = SamplingLoop::spawn("test", Duration::from_millis(5), move || {
            vec![c.fetch_add(1, Ordering::SeqCst)]
        })
        .unwrap();
        thread::sleep(Duration::from_millis(60));
        let result = sampler.stop(Duration::from_secs(1));
        assert!(result.monitoring_successful);
        assert!(!result.stop_timed_out);
        assert!(result.records().len() >= 2);
        assert!(result.records().windows(2).all(|w| w[0] < w[1]));
        assert!(result.session.ended_at.is_some());
        assert!(!result.session.running);
    }

    #[test]
    fn stopped_before_any_record_is_unsuccessful_not_an_error() {
        let sampler =
            SamplingLoop::<u32>::spawn("test", Duration::from_secs(60), Vec::new).unwrap();
        let result = sampler.stop(Duration::from_secs(1));
        assert!(result.records().is_empty());
        assert!(!result.monitoring_successful);
        assert!(!result.stop_timed_out);
    }

    #[test]
    fn stop_is_prompt_for_long_intervals() {
        let sampler =
            SamplingLoop::spawn("test", Duration::from_secs(60), || vec![1u8]).unwrap();
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        let result = sampler.stop(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(result.records(), &[1]);
    }

    #[test]
    fn hung_loop_returns_partial_data_after_timeout() {
        let mut first = true;
        let sampler = SamplingLoop::spawn("test", Duration::from_millis(1), move || {
            if first {
                first = false;
                vec![7u8]
            } else {
                thread::sleep(Duration::from_millis(500));
                Vec::new()
            }
        })
        .unwrap();
        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        let result = sampler.stop(Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(400));
        assert!(result.stop_timed_out);
        assert_eq!(result.records(), &[7]);
        assert_eq!(result.warnings.len(), 1);
    }
}
