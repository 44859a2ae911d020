// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running platform tools (`dmesg`, `lspci`, switch CLIs) with a hard
//! timeout. A tool that hangs is killed; it never stalls a sampling loop for
//! longer than its own budget.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Error;

/// Default budget for one external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const WAIT_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy)]
pub struct HostCommandSpec<'a> {
    pub program: &'a str,
    pub args: &'a [&'a str],
    pub timeout: Duration,
}

impl<'a> HostCommandSpec<'a> {
    pub const fn new(program: &'a str, args: &'a [&'a str]) -> Self {
        Self {
            program,
            args,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<Option<bool>, Error> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.success()));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(WAIT_INTERVAL.min(timeout.saturating_sub(start.elapsed())));
    }
}

/// Run `spec`, collecting its output. Exceeding the timeout kills the child
/// and returns [`Error::CommandTimeout`].
pub fn run_host_command(spec: HostCommandSpec<'_>) -> Result<HostCommandOutput, Error> {
    let mut child = Command::new(spec.program)
        .args(spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Command {
            program: spec.program.to_string(),
            reason: e.to_string(),
        })?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    match wait_with_deadline(&mut child, spec.timeout)? {
        Some(success) => Ok(HostCommandOutput {
            success,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        }),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            tracing::warn!(program = spec.program, timeout = ?spec.timeout, "command timed out");
            Err(Error::CommandTimeout {
                program: spec.program.to_string(),
                timeout: spec.timeout,
            })
        }
    }
}

/// Run `spec` and return its stdout, treating a non-zero exit as an error.
pub fn command_stdout(spec: HostCommandSpec<'_>) -> Result<String, Error> {
    let output = run_host_command(spec)?;
    if output.success {
        Ok(output.stdout)
    } else {
        Err(Error::Command {
            program: spec.program.to_string(),
            reason: format!("exited unsuccessfully: {}", output.stderr.trim()),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn collects_stdout() {
        let out = command_stdout(HostCommandSpec::new("sh", &["-c", "echo link up"])).unwrap();
        assert_eq!(out.trim(), "link up");
    }

    #[test]
    fn reports_nonzero_exit() {
        let err = command_stdout(HostCommandSpec::new("sh", &["-c", "echo nope >&2; exit 3"]))
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn kills_hung_command() {
        let start = Instant::now();
        let err = run_host_command(
            HostCommandSpec::new("sleep", &["10"]).with_timeout(Duration::from_millis(100)),
        )
        .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_program_is_a_command_error() {
        let err = run_host_command(HostCommandSpec::new("linkqa-no-such-tool", &[])).unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }
}
