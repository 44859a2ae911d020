// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-call timeouts for a register backend.
//!
//! Requests are handed to one worker thread that owns the backend. The
//! caller waits at most `timeout` for the reply. A request that is still
//! queued when its deadline passes is dropped unexecuted, so a late write can
//! never land after the caller has given up on it.

use parking_lot::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use super::{RegisterAccess, RegisterError, Width};
use crate::pcie::Bdf;

enum Operation {
    Read,
    Write(u32),
    Probe,
}

struct Request {
    bdf: Bdf,
    offset: u16,
    width: Width,
    operation: Operation,
    deadline: Instant,
    reply: mpsc::SyncSender<Result<u32, RegisterError>>,
}

pub struct TimedRegisterAccess {
    requests: Mutex<mpsc::Sender<Request>>,
    timeout: Duration,
}

impl TimedRegisterAccess {
    pub fn new<A>(inner: A, timeout: Duration) -> Result<Self, RegisterError>
    where
        A: RegisterAccess + 'static,
    {
        let (tx, rx) = mpsc::channel::<Request>();
        thread::Builder::new()
            .name(String::from("register-worker"))
            .spawn(move || {
                for request in rx {
                    if Instant::now() > request.deadline {
                        continue;
                    }
                    let result = match request.operation {
                        Operation::Read => {
                            inner.read_config(&request.bdf, request.offset, request.width)
                        }
                        Operation::Write(value) => inner
                            .write_config(&request.bdf, request.offset, request.width, value)
                            .map(|_| 0),
                        Operation::Probe => inner.probe().map(|_| 0),
                    };
                    // The caller may have timed out and gone away.
                    let _ = request.reply.send(result);
                }
            })?;
        Ok(Self {
            requests: Mutex::new(tx),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn call(
        &self,
        bdf: &Bdf,
        offset: u16,
        width: Width,
        operation: Operation,
    ) -> Result<u32, RegisterError> {
        let (reply, response) = mpsc::sync_channel(1);
        let request = Request {
            bdf: *bdf,
            offset,
            width,
            operation,
            deadline: Instant::now() + self.timeout,
            reply,
        };
        self.requests
            .lock()
            .send(request)
            .map_err(|_| RegisterError::Unavailable(String::from("register worker exited")))?;
        match response.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(RegisterError::Timeout(self.timeout)),
            // Dropped without a reply: the request expired in the queue.
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(RegisterError::Timeout(self.timeout))
            }
        }
    }
}

impl RegisterAccess for TimedRegisterAccess {
    fn read_config(&self, bdf: &Bdf, offset: u16, width: Width) -> Result<u32, RegisterError> {
        self.call(bdf, offset, width, Operation::Read)
    }

    fn write_config(
        &self,
        bdf: &Bdf,
        offset: u16,
        width: Width,
        value: u32,
    ) -> Result<(), RegisterError> {
        self.call(bdf, offset, width, Operation::Write(value))
            .map(|_| ())
    }

    fn probe(&self) -> Result<(), RegisterError> {
        self.call(&Bdf::new(0, 0, 0, 0), 0, Width::Byte, Operation::Probe)
            .map(|_| ())
    }
}
